pub mod booking;
pub mod payment;
pub mod subscription;
