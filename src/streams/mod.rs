pub mod completion;
pub mod error;
pub mod trace;
pub mod writable;

// Re-export main types
pub use completion::*;
pub use error::*;
pub use trace::*;
pub use writable::*;

pub type StreamResult<T> = Result<T, error::StreamError>;

/// Generic queuing strategy trait.
///
/// Both members are optional in the WHATWG sense: the defaults give every chunk
/// a cost of 1 and a high water mark of 1.
pub trait QueuingStrategy<T> {
    /// Return the cost of the chunk. May fail; a failure errors the stream.
    fn size(&self, chunk: &T) -> StreamResult<f64> {
        let _ = chunk;
        Ok(1.0)
    }

    /// Return high water mark (queued cost above which backpressure applies)
    fn high_water_mark(&self) -> f64 {
        1.0
    }
}

/// Count-based strategy
#[derive(Clone, Debug)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl Default for CountQueuingStrategy {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> StreamResult<f64> {
        Ok(1.0)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Clone, Debug)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<&'static [u8]> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &&'static [u8]) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Strategy backed by a caller-supplied cost function.
pub struct SizeFnQueuingStrategy<F> {
    high_water_mark: f64,
    size: F,
}

impl<F> SizeFnQueuingStrategy<F> {
    pub fn new(high_water_mark: f64, size: F) -> Self {
        Self {
            high_water_mark,
            size,
        }
    }
}

impl<T, F> QueuingStrategy<T> for SizeFnQueuingStrategy<F>
where
    F: Fn(&T) -> StreamResult<f64>,
{
    fn size(&self, chunk: &T) -> StreamResult<f64> {
        (self.size)(chunk)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}
