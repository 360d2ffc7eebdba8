pub mod dither;
pub mod overlap_add;
pub mod patch;
pub mod ptn;
pub mod resampler;
pub mod structure;

pub use dither::{safe_log2, TERMINAL_DITHER_FLOAT, TERMINAL_DITHER_INT};
pub use overlap_add::{choose_fft_size, GammaChirpFrontend, OlaFilter1D, OlaFilterBank};
pub use resampler::Resampler;
