pub mod codec;
pub mod config;
pub mod confirmation;
pub mod directive;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod gateway;
pub mod identity;
pub mod operators;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod transport;

pub use config::{AttributeTable, GatewayConfig};
pub use directive::{Directive, FleetReport};
pub use discovery::{DiscoveredDevice, DiscoveredDeviceSet};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayBuilder};
pub use identity::{DeviceAddress, DeviceId, address_to_id, id_to_address};
pub use operators::{Operator, OperatorSpec};
pub use scheduler::{DeviceReport, TestOutcome};
pub use session::{MessageHandler, Session};
pub use shutdown::Shutdown;
pub use store::{FileRecordStore, MemoryRecordStore, RecordStore};
