//! Broker transport implementations

pub mod mqtt;

pub use mqtt::MqttTransport;
