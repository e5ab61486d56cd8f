pub mod mdns;
pub mod messages;
pub mod tcp;
