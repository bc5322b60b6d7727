pub mod backend;
pub mod codec;
pub mod config;
pub mod events;
pub mod link;
pub mod observer;
pub mod player;
pub mod popup;
pub mod relay;
pub mod remote;
pub mod runtime;
pub mod storage;
pub mod tabs;
pub mod volume;
