//! Domain layer: orders, their synchronization state, the provider's payment
//! model and the ports the application layer talks through.

pub mod order;
pub mod payment;
pub mod ports;
pub mod resolver;
pub mod sync;
