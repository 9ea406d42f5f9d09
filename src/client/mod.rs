//! Client-side sync engine: connection and session state machines, the
//! runtime event loop, and the user-visible session facade.

pub mod backoff;
pub mod bootstrap;
pub mod connection;
pub mod endpoint;
pub mod frame;
pub mod notifier;
pub mod progress;
pub mod proto;
pub mod reset;
pub mod runtime;
pub mod session;
pub mod sync_session;
pub mod transport;

pub use backoff::{ConnectionTerminationReason, ReconnectDelay, ReconnectInfo};
pub use connection::{Connection, ConnectionAction, ConnectionParams, ConnectionTimer};
pub use endpoint::{ProtocolEnvelope, ServerEndpoint, UrlError};
pub use notifier::{ConnectionState, ConnectionStateNotifier, NotifierToken};
pub use progress::{ProgressDirection, ProgressNotifier, ProgressSample, ProgressToken};
pub use proto::{ClientMessage, ProtoLimits, ServerMessage};
pub use runtime::{BindSessionArgs, ClientEvent, SyncClient};
pub use session::{Session, SessionEvent, SessionLifecycle};
pub use sync_session::{ExternalReference, SyncSession, SyncSessionState};
pub use transport::{
    MemoryServerEnd, MemoryTransportProvider, TcpTransportProvider, Transport, TransportCloseKind,
    TransportEndpoint, TransportObserver, TransportProvider,
};
