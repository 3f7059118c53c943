mod common;
mod threads;
