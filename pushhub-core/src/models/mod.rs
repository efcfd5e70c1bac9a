pub mod id;
pub mod notification;

pub use id::{ClientToken, UserId};
pub use notification::Notification;
