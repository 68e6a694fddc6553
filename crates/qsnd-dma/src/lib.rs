// qsnd-dma — frame-stepped sound scheduling over a DMA-style output buffer.
//
// The scheduler decides which sounds are audible, on which channel they
// play, at what stereo volume, and at what sample time they begin mixing.
// Sample painting, audio decoding, and the physical device live behind the
// traits in `snd_loc`.

#![allow(clippy::too_many_arguments, clippy::needless_range_loop)]

pub mod snd_dma;
pub mod snd_loc;
pub mod sound_types;

pub use snd_dma::{Channel, Playsound, SoundState};
pub use snd_loc::{
    AccelBackend, AmbientMode, Dma, DmaDriver, EntitySound, Listener, PaintView,
    PortableSamplePair, SampleLoader, SamplePainter, SndError, SoundConfig, SoundFrame,
    SoundOutput, SoundStarted, MAX_CHANNELS, MAX_PLAYSOUNDS, MAX_RAW_SAMPLES, MAX_SFX,
};
pub use sound_types::{Sfx, SfxCache};
