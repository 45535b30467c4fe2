pub mod supervisor;

pub use supervisor::{PreviewError, PreviewState, PreviewStatus, PreviewSupervisor, ProxyError};
