pub mod correlator;
pub mod message;
pub mod transport;

pub use correlator::{RpcCorrelator, RpcOutcome};
pub use message::{Envelope, Method, Request, RequestPayload, Response, ResponsePayload};
pub use transport::{TcpTransport, Transport, MAX_MESSAGE_LENGTH};
