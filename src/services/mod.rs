pub mod assembler;
pub mod backend;
pub mod flipbook;
pub mod illustration;
pub mod llm;
pub mod remote;
pub mod render;
pub mod server;
pub mod story;
pub mod typeface;
pub mod workflow;
