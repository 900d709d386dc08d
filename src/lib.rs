pub mod streams;
pub use streams::writable::{
    UnderlyingSink, WritableSink, WritableStream, WritableStreamBuilder,
    WritableStreamDefaultController, WritableStreamDefaultWriter,
};
pub use streams::*;
