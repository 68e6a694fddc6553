// snd_loc.rs — types and traits shared between the scheduler, the output
// device, the painting stage, and the optional accelerated backend.

use qsnd_common::q_shared::{Vec3, MAX_SOUNDS};
use thiserror::Error;

use crate::snd_dma::Channel;
use crate::sound_types::{Sfx, SfxCache};

// ============================================================
// Constants
// ============================================================

pub const MAX_CHANNELS: usize = 32;
pub const MAX_PLAYSOUNDS: usize = 128;

/// Ring size for externally streamed samples. Must stay a power of two;
/// write indices are masked, not bounds-checked.
pub const MAX_RAW_SAMPLES: usize = 8192;

/// During registration it is possible to have more sounds than could
/// actually be referenced during gameplay, because nothing is freed until
/// the sweep at the end of registration.
pub const MAX_SFX: usize = MAX_SOUNDS * 2;

/// Only begin attenuating sound volumes when outside this range.
pub const SOUND_FULLVOLUME: f32 = 80.0;
pub const SOUND_LOOPATTENUATE: f32 = 0.003;

/// Painted time gets chopped back to zero before it can reach 32-bit
/// overflow; everything playing is dropped when that happens.
pub const PAINT_TIME_CEILING: i32 = 0x4000_0000;

// ============================================================
// Device-side data
// ============================================================

/// Output buffer parameters reported by the DMA driver at init.
#[derive(Clone, Copy, Debug, Default)]
pub struct Dma {
    /// 1 = mono output, 2 = stereo.
    pub channels: i32,
    /// Total mono samples in the device buffer.
    pub samples: i32,
    /// Never mix less than this many samples at once.
    pub submission_chunk: i32,
    pub samplebits: i32,
    /// Output rate in Hz; the internal sample clock counts at this rate.
    pub speed: i32,
}

/// One mixed stereo sample pair awaiting output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortableSamplePair {
    pub left: i32,
    pub right: i32,
}

#[derive(Debug, Error)]
pub enum SndError {
    #[error("sound device initialization failed: {0}")]
    DeviceInit(String),
    #[error("accelerated sound backend initialization failed: {0}")]
    BackendInit(String),
}

// ============================================================
// Game-state snapshots handed in each frame
// ============================================================

/// Listener frame of reference, refreshed once per update call.
#[derive(Clone, Copy, Debug, Default)]
pub struct Listener {
    pub origin: Vec3,
    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
}

/// One visible entity's sound contribution for this frame.
#[derive(Clone, Debug, Default)]
pub struct EntitySound {
    pub number: i32,
    pub origin: Vec3,
    /// Precache index of the entity's ambient sound; 0 = none.
    pub sound: i32,
    pub modelindex: i32,
}

/// Per-frame client state handed to `SoundState::update`.
pub struct SoundFrame<'a> {
    /// Spatial data is only valid while fully connected and active.
    pub active: bool,
    pub paused: bool,
    /// Loading plaque is up; keep the output buffer silent instead of
    /// looping stale contents.
    pub loading: bool,
    pub sound_prepped: bool,
    pub entities: &'a [EntitySound],
    /// Maps precache sound indices to registered sfx slots.
    pub sound_precache: &'a [Option<usize>],
}

// ============================================================
// Configuration
// ============================================================

/// Which entities may contribute ambient loop sounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmbientMode {
    Off,
    All,
    /// Entities without a model are muted.
    NoModelless,
    /// Only the local player entity contributes.
    PlayerOnly,
}

/// User-settable knobs, owned by the sound system. The surrounding
/// console/cvar layer is expected to push changes in through these fields
/// (volume via `SoundState::set_volume` so scale tables get rebuilt).
#[derive(Clone, Debug)]
pub struct SoundConfig {
    pub volume: f32,
    /// Seconds of audio to mix ahead of the device position.
    pub mixahead: f32,
    pub ambient: AmbientMode,
    /// Per-frame channel dump through the log.
    pub show: bool,
}

impl Default for SoundConfig {
    fn default() -> Self {
        Self {
            volume: 0.7,
            mixahead: 0.14,
            ambient: AmbientMode::All,
            show: false,
        }
    }
}

// ============================================================
// External collaborators
// ============================================================

/// Physical output device. The driver owns the raw buffer; the scheduler
/// only ever sees sample counts and positions.
pub trait DmaDriver {
    fn init(&mut self) -> Result<Dma, SndError>;

    /// Current hardware playback position in buffer sample units. Polled,
    /// never awaited; wraps at the buffer length.
    fn sample_position(&mut self) -> i32;

    /// Take exclusive access to the output buffer for one mix pass. Every
    /// `begin_painting` is paired with a `submit`.
    fn begin_painting(&mut self);
    fn submit(&mut self);

    fn shutdown(&mut self);
}

/// Everything the painting stage may read while mixing one window.
pub struct PaintView<'a> {
    pub channels: &'a mut [Channel],
    pub known_sfx: &'a [Sfx],
    pub rawsamples: &'a [PortableSamplePair],
    pub rawend: i32,
    pub paintedtime: i32,
}

/// The sample-painting stage. Mixing math lives entirely behind this
/// trait; the scheduler advances `paintedtime` to `endtime` after each
/// `paint` call.
pub trait SamplePainter {
    fn paint(&mut self, driver: &mut dyn DmaDriver, view: PaintView<'_>, endtime: i32);

    /// Flush the whole device buffer to silence (0x80 for 8-bit output,
    /// 0 otherwise). Owns its own begin_painting/submit pairing.
    fn clear(&mut self, driver: &mut dyn DmaDriver, dma: &Dma);

    /// Master volume changed; rebuild scale tables before the next mix.
    fn set_volume(&mut self, _volume: f32) {}
}

/// Hardware-accelerated backend that replaces the whole mixing path.
/// While active, spatialization, drift correction, and the raw-sample
/// ring are bypassed in favor of the backend's own equivalents.
pub trait AccelBackend {
    fn init(&mut self) -> Result<(), SndError>;
    fn shutdown(&mut self);

    fn play_channel(&mut self, ch_idx: usize, ch: &Channel, sc: &SfxCache, volume: f32);
    fn stop_channel(&mut self, ch_idx: usize);
    fn stop_all(&mut self);

    fn raw_samples(
        &mut self,
        samples: i32,
        rate: i32,
        width: i32,
        channels: i32,
        data: &[u8],
        volume: f32,
    );

    fn update_listener(&mut self, listener: &Listener);

    /// Per-frame backend tick.
    fn update(&mut self);
}

/// Asset layer. Decoding and caching of sample data is out of scope; the
/// scheduler only asks for a populated cache.
pub trait SampleLoader {
    /// Ensure `sfx.cache` is populated. Returns false when the sound's
    /// data cannot be resolved; the caller drops the request silently.
    fn load(&mut self, sfx: &mut Sfx) -> bool;

    /// Probe whether a sound file exists without registering it.
    fn exists(&mut self, name: &str) -> bool;
}

// ============================================================
// Output selection
// ============================================================

/// Which output path has been started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SoundStarted {
    #[default]
    Not,
    Dma,
    Accel,
}

/// The output path, selected once at startup and passed to every call
/// that touches the device.
pub enum SoundOutput {
    Dma {
        driver: Box<dyn DmaDriver>,
        painter: Box<dyn SamplePainter>,
    },
    Accel(Box<dyn AccelBackend>),
}
