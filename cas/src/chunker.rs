use fastcdc::v2020::FastCDC;
use thiserror::Error;

/// Content-defined chunking parameters, in bytes.
///
/// Boundaries are placed by the FastCDC gear hash: no cut before `min_size`,
/// a forced cut at `max_size`, and an expected chunk size of `avg_size` in
/// between. The gear table is fixed, so the same input always yields the
/// same cut points on every publisher and reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkerConfig {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        // Average matches the remote chunk size used by readers; min/max at
        // half and double of that, following the usual FastCDC setup.
        let avg_size = 256 * 1024;
        Self {
            min_size: avg_size / 2,
            avg_size,
            max_size: avg_size * 2,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ChunkerConfigError {
    #[error("chunk sizes must satisfy min <= avg <= max, got {min}/{avg}/{max}")]
    Unordered { min: u32, avg: u32, max: u32 },
    #[error("chunk sizes below the algorithm floor (min >= 64, avg >= 256, max >= 1024)")]
    BelowFloor,
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<(), ChunkerConfigError> {
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(ChunkerConfigError::Unordered {
                min: self.min_size,
                avg: self.avg_size,
                max: self.max_size,
            });
        }
        // Floors imposed by the fastcdc implementation.
        if self.min_size < 64 || self.avg_size < 256 || self.max_size < 1024 {
            return Err(ChunkerConfigError::BelowFloor);
        }
        Ok(())
    }
}

/// One contiguous span of an input file, before compression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpan {
    pub offset: u64,
    pub size: u64,
}

/// Stateless content-defined chunker over in-memory (mapped) input.
#[derive(Clone, Copy, Debug)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkerConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Compute the cut points for `data`. The returned spans tile
    /// `[0, data.len())` in ascending order; EOF always terminates the last
    /// span, whatever its size.
    pub fn cut_points(&self, data: &[u8]) -> Vec<ChunkSpan> {
        FastCDC::new(
            data,
            self.config.min_size,
            self.config.avg_size,
            self.config.max_size,
        )
        .map(|chunk| ChunkSpan {
            offset: chunk.offset as u64,
            size: chunk.length as u64,
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: ChunkerConfig = ChunkerConfig {
        min_size: 64,
        avg_size: 256,
        max_size: 1024,
    };

    /// xorshift-style generator so the input has content-dependent structure
    /// without dragging randomness into the expected values.
    fn scrambled(len: usize) -> Vec<u8> {
        let mut state = 0x9e3779b97f4a7c15u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[rstest::rstest]
    #[case::one_chunk(100)]
    #[case::a_few_chunks(1_000)]
    #[case::many_chunks(10_000)]
    #[case::larger_than_max_times_many(100_000)]
    fn spans_tile_the_input(#[case] len: usize) {
        let chunker = Chunker::new(TEST_CONFIG).unwrap();
        let data = scrambled(len);
        let spans = chunker.cut_points(&data);

        assert!(!spans.is_empty());
        let mut expected_offset = 0u64;
        for span in &spans {
            assert_eq!(span.offset, expected_offset);
            assert!(span.size > 0);
            expected_offset += span.size;
        }
        assert_eq!(expected_offset, data.len() as u64);
    }

    #[test]
    fn spans_respect_min_and_max() {
        let chunker = Chunker::new(TEST_CONFIG).unwrap();
        let data = scrambled(50_000);
        let spans = chunker.cut_points(&data);

        for span in &spans[..spans.len() - 1] {
            assert!(span.size >= TEST_CONFIG.min_size as u64);
            assert!(span.size <= TEST_CONFIG.max_size as u64);
        }
        // The final span is whatever EOF leaves over, but never oversized.
        assert!(spans.last().unwrap().size <= TEST_CONFIG.max_size as u64);
    }

    #[test]
    fn cut_points_are_deterministic() {
        let chunker = Chunker::new(TEST_CONFIG).unwrap();
        let data = scrambled(30_000);
        assert_eq!(chunker.cut_points(&data), chunker.cut_points(&data));
    }

    #[test]
    fn short_input_is_a_single_span() {
        let chunker = Chunker::new(TEST_CONFIG).unwrap();
        let data = scrambled(100);
        let spans = chunker.cut_points(&data);
        assert_eq!(
            spans,
            vec![ChunkSpan {
                offset: 0,
                size: 100
            }]
        );
    }

    #[test]
    fn empty_input_yields_no_spans() {
        let chunker = Chunker::new(TEST_CONFIG).unwrap();
        assert!(chunker.cut_points(&[]).is_empty());
    }

    #[test]
    fn config_validation() {
        assert!(ChunkerConfig::default().validate().is_ok());
        assert_eq!(
            ChunkerConfig {
                min_size: 512,
                avg_size: 256,
                max_size: 1024
            }
            .validate(),
            Err(ChunkerConfigError::Unordered {
                min: 512,
                avg: 256,
                max: 1024
            })
        );
        assert_eq!(
            ChunkerConfig {
                min_size: 16,
                avg_size: 256,
                max_size: 1024
            }
            .validate(),
            Err(ChunkerConfigError::BelowFloor)
        );
    }
}
