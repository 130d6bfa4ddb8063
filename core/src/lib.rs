pub mod api;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod refresh;
pub mod session;
pub mod state;
pub mod stream;
pub mod telemetry;
pub mod transport;


pub use api::{unwrap_envelope, ChatApi, FileUpload, Registration};
pub use cache::ResponseCache;
pub use config::{ClientSettings, ConfigError};
pub use credentials::{Credential, CredentialStore};
pub use error::{Error, Result};
pub use refresh::{CredentialRefresher, EndpointRefresher, PendingRequest, RefreshCoordinator, RefreshState};
pub use session::{ChatSession, Phase, SendReceipt};
pub use state::{AiModel, ChatMessage, ChatRequest, Conversation, MessageKind, MessageRole};
pub use stream::{CancelHandle, Frame, FrameDecoder, StreamConsumer, StreamEvent};
pub use transport::{
    ApiRequest, ApiResponse, HttpTransport, MockReply, MockTransport, Replay, RequestBody, StreamTail,
    Transport,
};
