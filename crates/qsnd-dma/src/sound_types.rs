// sound_types.rs — registered sound effects and their cached sample data

/// A registered sound effect. Slots with an empty name are free for reuse;
/// the cache is populated lazily by the asset layer.
#[derive(Clone, Default)]
pub struct Sfx {
    pub name: String,
    pub registration_sequence: i32,
    pub cache: Option<Box<SfxCache>>,
    /// Resolved target when this entry is an alias.
    pub truename: Option<String>,
}

/// Decoded sample data descriptor. `length` counts samples at `speed`;
/// `loopstart` is -1 for one-shot sounds.
#[derive(Clone)]
pub struct SfxCache {
    pub length: i32,
    pub loopstart: i32,
    pub speed: i32,
    pub width: i32,
    pub stereo: i32,
    pub data: Vec<u8>,
}

impl Default for SfxCache {
    fn default() -> Self {
        Self {
            length: 0,
            loopstart: -1,
            speed: 0,
            width: 0,
            stereo: 0,
            data: Vec::new(),
        }
    }
}
