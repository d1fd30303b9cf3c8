pub mod device;
pub mod loader;
pub mod streaming;

pub use device::{DeviceConfig, SipConfig, SipTransport};
pub use loader::{ConfigLoader, GbcamConfig};
pub use streaming::{
    EncoderPreset, EosPolicy, RtspSourceConfig, StreamingConfig, CATALOG_MAX_ITEMS_DEFAULT,
};
