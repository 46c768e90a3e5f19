pub mod codec;
pub mod config;
pub mod coordinator;
pub mod engine_client;
pub mod error;
pub mod io_struct;
pub mod logging;
pub mod registry;
pub mod router;
pub mod transport;

pub use config::PDConfig;
pub use coordinator::{LifecycleState, PDCoordinator, Transports};
pub use engine_client::{EngineClient, GenerateStream};
pub use error::{PDError, PDResult, Phase};
pub use io_struct::{GenerateOptions, PDRequest, PDResponse, Prompt, SamplingParams};
