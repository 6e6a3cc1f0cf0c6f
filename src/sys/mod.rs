mod epoll;
mod eventfd;
mod fd;

pub use epoll::{Epoll, Events};
pub use eventfd::EventFd;
