pub mod error;
pub mod options;
pub mod crc;
pub mod flux;
pub mod pll;
pub mod fusion;
pub mod codec;
pub mod recovery;
pub mod correct;
pub mod perf;
pub mod pipeline;
pub mod session;
pub mod io_stream;
pub mod synth;

pub use error::{DecodeError, Result};
pub use options::DecodeOptions;
pub use flux::{FluxRevolution, PreAnalysis};
pub use flux::histogram::{estimate, BitrateEstimate, DensityClass};
pub use pll::{DecodedBitstream, PllConfig};
pub use fusion::{fuse, FusionConfig, FusionResult};
pub use codec::{get_line_code, Encoding, LineCode};
pub use recovery::{SectorId, SectorRecord, TrackQuality, TrackSummary};
pub use correct::{correct_sector, CorrectionOutcome, CorrectorConfig};
pub use pipeline::{CancelToken, TrackDecoder, TrackRequest, TrackResult};
pub use session::DecodeSession;
pub use io_stream::FluxDump;
