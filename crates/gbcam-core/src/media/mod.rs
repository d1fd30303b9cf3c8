// 媒体分发层
// SIP 对话 → 媒体管线：源（文件/RTSP）→ 打包 → RTP 发送

pub mod pipeline;
pub mod rtp;
pub mod session;
pub mod supervisor;

pub use pipeline::{PipelineHandle, PipelineSource, PipelineSpec, PipelineState, PayloadKind};
pub use rtp::{h264_payloads, ps_wrap, RtpSender};
pub use session::{MediaSession, SessionManager, SessionState};
pub use supervisor::{restart_delay, HealthAlert, HealthObserver, SupervisorEvent, Watchdog};
