//! Helpers for connecting to a RabbitMq broker.

pub mod configuration;
pub mod convenience;
mod factory;
mod link;

pub use convenience::BasicPropertiesExt;
pub use factory::ConnectionFactory;
pub use link::AmqpLink;

pub use lapin::{options, types, BasicProperties};
