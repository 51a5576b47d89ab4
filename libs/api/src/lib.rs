pub mod event;
pub mod path;
pub mod recording;
pub mod request;
pub mod response;
pub mod wav;
