// SIP 信令引擎
// 设备侧：注册、心跳、请求分发、对话与订阅管理

pub mod auth;
pub mod dialog;
pub mod dispatch;
pub mod message;
pub mod registration;
pub mod transport;

pub use auth::{compute_digest_response, parse_digest_params, DigestChallenge};
pub use dialog::{Dialog, DialogManager, Subscription};
pub use dispatch::{Dispatcher, DispatcherConfig};
pub use message::{Headers, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registration::{RegistrationConfig, RegistrationState, Registrar};
pub use transport::{
    new_branch, new_call_id, new_tag, Inbound, SipTransport, TransportConfig, TransportKind,
};
