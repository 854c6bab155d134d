pub mod config;
pub mod decode;
pub mod export;
pub mod merge;
pub mod receiver;
pub mod run;
pub mod sink;
pub mod transport;
