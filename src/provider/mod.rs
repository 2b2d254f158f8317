pub mod maas;

pub use maas::{InterfaceInfo, MaasApi, MaasClient};
