//! Wire layer between the host and its worker process.
//!
//! # Architecture
//!
//! - **protocol**: envelope types (Call, Notify, Response) and call results
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **transport**: worker launch, stdio or fd 3/4 pipes, shared frame writer

pub mod codec;
pub mod protocol;
pub mod transport;
