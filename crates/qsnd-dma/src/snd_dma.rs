// snd_dma.rs — sound dispatch, channel management, and the sample clock.
//
// Upper layer of the sound output. Decides which sounds are audible, on
// which channel they play, and over which sample window the painting
// stage mixes them. Needs a DMA-capable lower level behind `DmaDriver`,
// or an accelerated backend behind `AccelBackend` that replaces the
// whole mixing path.

use log::{debug, info, warn};

use qsnd_common::q_shared::{
    dot_product, vector_normalize, vector_subtract, Vec3, ATTN_STATIC, CS_PLAYERSKINS, MAX_QPATH,
};

use crate::snd_loc::*;
use crate::sound_types::Sfx;

// ============================================================
// Types
// ============================================================

/// One active playback slot. Exclusively owned by the pool; cleared to
/// `Default` whenever it is reclaimed.
#[derive(Clone, Default)]
pub struct Channel {
    pub sfx: Option<usize>,
    pub leftvol: i32,
    pub rightvol: i32,
    /// Absolute sample time this channel stops contributing.
    pub end: i32,
    /// Sample cursor into the sfx data.
    pub pos: i32,
    pub entnum: i32,
    pub entchannel: i32,
    /// Only meaningful when fixed_origin is set.
    pub origin: Vec3,
    pub dist_mult: f32,
    pub master_vol: i32,
    pub fixed_origin: bool,
    /// Ambient channel; regenerated fresh each frame.
    pub autosound: bool,
}

/// A deferred sound-start request. Lives in exactly one of the free or
/// pending intrusive lists at all times; `prev`/`next` are slot indices
/// into the playsound arena (the two sentinel slots sit past the pool).
#[derive(Clone, Default)]
pub struct Playsound {
    pub prev: usize,
    pub next: usize,
    pub sfx: Option<usize>,
    pub volume: f32,
    pub attenuation: f32,
    pub entnum: i32,
    pub entchannel: i32,
    pub fixed_origin: bool,
    pub origin: Vec3,
    /// Absolute sample time the sound begins.
    pub begin: i32,
}

// ============================================================
// Sound system state
// ============================================================

pub struct SoundState {
    pub started: SoundStarted,
    pub dma: Dma,
    pub config: SoundConfig,
    pub volume_modified: bool,

    pub channels: [Channel; MAX_CHANNELS],

    pub listener: Listener,
    /// Spatial data valid; outside an active connection everything plays
    /// at full volume.
    pub active: bool,

    pub registration_sequence: i32,
    pub registering: bool,
    pub known_sfx: Vec<Sfx>,
    pub num_sfx: usize,

    /// MAX_PLAYSOUNDS pool slots plus the two list sentinels.
    pub playsounds: Vec<Playsound>,
    pub freeplays: usize,
    pub pendingplays: usize,

    /// Persistent drift correction between server time and the sample
    /// clock for sound start times.
    pub beginofs: i32,

    /// Samples the device reports as physically consumed.
    pub soundtime: i32,
    /// Samples already queued for mixing; the internal clock.
    pub paintedtime: i32,
    pub oldsamplepos: i32,
    /// Device buffer wrap count since the last clock reset.
    pub buffers: i32,

    pub rawsamples: Vec<PortableSamplePair>,
    pub rawend: i32,
}

impl SoundState {
    pub fn new(config: SoundConfig) -> Self {
        let mut s = Self {
            started: SoundStarted::Not,
            dma: Dma::default(),
            config,
            volume_modified: false,
            channels: std::array::from_fn(|_| Channel::default()),
            listener: Listener::default(),
            active: false,
            registration_sequence: 0,
            registering: false,
            known_sfx: Vec::with_capacity(MAX_SFX),
            num_sfx: 0,
            playsounds: vec![Playsound::default(); MAX_PLAYSOUNDS + 2],
            freeplays: MAX_PLAYSOUNDS,
            pendingplays: MAX_PLAYSOUNDS + 1,
            beginofs: 0,
            soundtime: 0,
            paintedtime: 0,
            oldsamplepos: 0,
            buffers: 0,
            rawsamples: vec![PortableSamplePair::default(); MAX_RAW_SAMPLES],
            rawend: 0,
        };
        s.reset_playsounds();
        s
    }

    pub fn init(&mut self, output: &mut SoundOutput) -> Result<(), SndError> {
        info!("------- sound initialization -------");

        match output {
            SoundOutput::Dma { driver, .. } => {
                self.dma = match driver.init() {
                    Ok(dma) => dma,
                    Err(e) => {
                        warn!("sound device not initializing: {}", e);
                        return Err(e);
                    }
                };
                self.started = SoundStarted::Dma;
                info!("sound sampling rate: {}", self.dma.speed);
            }
            SoundOutput::Accel(backend) => {
                if let Err(e) = backend.init() {
                    warn!("accelerated sound backend not initializing: {}", e);
                    return Err(e);
                }
                self.started = SoundStarted::Accel;
            }
        }

        self.num_sfx = 0;
        self.soundtime = 0;
        self.paintedtime = 0;

        self.stop_all_sounds(output);

        info!("------------------------------------");
        Ok(())
    }

    pub fn shutdown(&mut self, output: &mut SoundOutput) {
        if self.started == SoundStarted::Not {
            return;
        }

        match output {
            SoundOutput::Accel(backend) => {
                backend.stop_all();
                backend.shutdown();
            }
            SoundOutput::Dma { driver, .. } => driver.shutdown(),
        }
        self.started = SoundStarted::Not;

        for sfx in self.known_sfx.iter_mut() {
            *sfx = Sfx::default();
        }
        self.num_sfx = 0;
    }

    /// Master volume changed; the painter rebuilds its scale tables on
    /// the next update.
    pub fn set_volume(&mut self, volume: f32) {
        if volume != self.config.volume {
            self.config.volume = volume;
            self.volume_modified = true;
        }
    }

    // ============================================================
    // Registration
    // ============================================================

    /// Look up a sound by name, optionally creating the entry. An empty
    /// or over-length name is a broken asset pipeline and aborts.
    pub fn find_name(&mut self, name: &str, create: bool) -> Option<usize> {
        if name.is_empty() {
            panic!("find_name: empty name");
        }
        if name.len() >= MAX_QPATH {
            panic!("sound name too long: {}", name);
        }

        // see if already registered
        for i in 0..self.num_sfx {
            if self.known_sfx[i].name == name {
                return Some(i);
            }
        }

        if !create {
            return None;
        }

        // reuse a swept slot before growing the table
        let mut slot = None;
        for i in 0..self.num_sfx {
            if self.known_sfx[i].name.is_empty() {
                slot = Some(i);
                break;
            }
        }

        let idx = match slot {
            Some(i) => i,
            None => {
                if self.num_sfx == MAX_SFX {
                    panic!("find_name: out of sfx slots");
                }
                self.known_sfx.push(Sfx::default());
                self.num_sfx += 1;
                self.num_sfx - 1
            }
        };

        self.known_sfx[idx] = Sfx {
            name: name.to_string(),
            registration_sequence: self.registration_sequence,
            ..Sfx::default()
        };

        Some(idx)
    }

    /// Register `aliasname` as an alias that resolves to `truename`.
    pub fn alias_name(&mut self, aliasname: &str, truename: &str) -> Option<usize> {
        let mut slot = None;
        for i in 0..self.num_sfx {
            if self.known_sfx[i].name.is_empty() {
                slot = Some(i);
                break;
            }
        }

        let idx = match slot {
            Some(i) => i,
            None => {
                if self.num_sfx == MAX_SFX {
                    panic!("alias_name: out of sfx slots");
                }
                self.known_sfx.push(Sfx::default());
                self.num_sfx += 1;
                self.num_sfx - 1
            }
        };

        self.known_sfx[idx] = Sfx {
            name: aliasname.to_string(),
            registration_sequence: self.registration_sequence,
            truename: Some(truename.to_string()),
            ..Sfx::default()
        };

        Some(idx)
    }

    pub fn begin_registration(&mut self) {
        self.registration_sequence += 1;
        self.registering = true;
    }

    pub fn register_sound(&mut self, name: &str, loader: &mut dyn SampleLoader) -> Option<usize> {
        if self.started == SoundStarted::Not {
            return None;
        }

        let idx = self.find_name(name, true)?;
        self.known_sfx[idx].registration_sequence = self.registration_sequence;

        if !self.registering {
            loader.load(&mut self.known_sfx[idx]);
        }

        Some(idx)
    }

    /// Resolve a `*`-prefixed sound against the model a player is using,
    /// falling back to the male sound when the model-specific file does
    /// not exist.
    pub fn register_sexed_sound(
        &mut self,
        ent_number: i32,
        base: &str,
        configstrings: &[String],
        loader: &mut dyn SampleLoader,
    ) -> Option<usize> {
        // determine what model the client is using
        let mut model = String::new();
        let n = CS_PLAYERSKINS + ent_number as usize - 1;
        if let Some(cs) = configstrings.get(n) {
            if let Some(pos) = cs.find('\\') {
                let after = &cs[pos + 1..];
                model = match after.find('/') {
                    Some(slash) => after[..slash].to_string(),
                    None => after.to_string(),
                };
            }
        }
        if model.is_empty() {
            model = "male".to_string();
        }

        let sexed_filename = format!("#players/{}/{}", model, &base[1..]);
        if let Some(idx) = self.find_name(&sexed_filename, false) {
            return Some(idx);
        }

        if loader.exists(&sexed_filename[1..]) {
            self.register_sound(&sexed_filename, loader)
        } else {
            // revert to the male sound
            let male_filename = format!("player/male/{}", &base[1..]);
            self.alias_name(&sexed_filename, &male_filename)
        }
    }

    /// Sweep sounds not touched this registration sequence, then load
    /// everything that survived.
    pub fn end_registration(&mut self, loader: &mut dyn SampleLoader) {
        for i in 0..self.num_sfx {
            if self.known_sfx[i].name.is_empty() {
                continue;
            }
            if self.known_sfx[i].registration_sequence != self.registration_sequence {
                // leftover from a server that didn't finish loading
                self.known_sfx[i] = Sfx::default();
            }
        }

        for i in 0..self.num_sfx {
            if self.known_sfx[i].name.is_empty() {
                continue;
            }
            loader.load(&mut self.known_sfx[i]);
        }

        self.registering = false;
    }

    // ============================================================
    // Channel pool
    // ============================================================

    /// Pick a channel for a new sound, evicting if necessary. A sound on
    /// the same (entnum, entchannel) is always replaced; channels owned
    /// by the local player are never evicted for another entity's sound;
    /// otherwise the channel with the least remaining lifetime dies.
    pub fn pick_channel(
        &mut self,
        entnum: i32,
        entchannel: i32,
        playernum: i32,
        accel: Option<&mut (dyn AccelBackend + '_)>,
    ) -> Option<usize> {
        if entchannel < 0 {
            panic!("pick_channel: entchannel < 0");
        }

        let mut first_to_die: i32 = -1;
        let mut life_left = i32::MAX;

        for ch_idx in 0..MAX_CHANNELS {
            let ch = &self.channels[ch_idx];

            // channel 0 never willingly overrides
            if entchannel != 0 && ch.entnum == entnum && ch.entchannel == entchannel {
                // always override sound from same entity
                first_to_die = ch_idx as i32;
                break;
            }

            // don't let monster sounds override player sounds
            if ch.entnum == playernum + 1 && entnum != playernum + 1 && ch.sfx.is_some() {
                continue;
            }

            if ch.end - self.paintedtime < life_left {
                life_left = ch.end - self.paintedtime;
                first_to_die = ch_idx as i32;
            }
        }

        if first_to_die == -1 {
            return None;
        }

        let idx = first_to_die as usize;
        if self.channels[idx].sfx.is_some() {
            // the voice must stop before the slot is reset
            if let Some(backend) = accel {
                backend.stop_channel(idx);
            }
        }
        self.channels[idx] = Channel::default();

        Some(idx)
    }

    // ============================================================
    // Spatialization
    // ============================================================

    /// Stereo gains for a source position. Pure with respect to channel
    /// state; used for channels and autosounds alike.
    pub fn spatialize_origin(&self, origin: &Vec3, master_vol: f32, dist_mult: f32) -> (i32, i32) {
        if !self.active {
            return (255, 255);
        }

        // calculate stereo separation and distance attenuation
        let mut source_vec = vector_subtract(origin, &self.listener.origin);
        let mut dist = vector_normalize(&mut source_vec);
        dist -= SOUND_FULLVOLUME;
        if dist < 0.0 {
            dist = 0.0; // close enough to be at full volume
        }
        dist *= dist_mult;

        let dot = dot_product(&self.listener.right, &source_vec);

        let (rscale, lscale) = if self.dma.channels == 1 || dist_mult == 0.0 {
            // no attenuation = no spatialization
            (1.0, 1.0)
        } else {
            (0.5 * (1.0 + dot), 0.5 * (1.0 - dot))
        };

        // add in distance effect
        let mut right_vol = (master_vol * ((1.0 - dist) * rscale)) as i32;
        if right_vol < 0 {
            right_vol = 0;
        }
        let mut left_vol = (master_vol * ((1.0 - dist) * lscale)) as i32;
        if left_vol < 0 {
            left_vol = 0;
        }

        (left_vol, right_vol)
    }

    pub fn spatialize(
        &mut self,
        ch_idx: usize,
        playernum: i32,
        get_entity_origin: &dyn Fn(i32) -> Vec3,
    ) {
        // anything coming from the view entity will always be full volume
        if self.channels[ch_idx].entnum == playernum + 1 {
            let vol = self.channels[ch_idx].master_vol;
            self.channels[ch_idx].leftvol = vol;
            self.channels[ch_idx].rightvol = vol;
            return;
        }

        let origin = if self.channels[ch_idx].fixed_origin {
            self.channels[ch_idx].origin
        } else {
            get_entity_origin(self.channels[ch_idx].entnum)
        };

        let (left, right) = self.spatialize_origin(
            &origin,
            self.channels[ch_idx].master_vol as f32,
            self.channels[ch_idx].dist_mult,
        );
        self.channels[ch_idx].leftvol = left;
        self.channels[ch_idx].rightvol = right;
    }

    // ============================================================
    // Playsound queue
    // ============================================================

    /// Unlink a playsound from the free list. None means the pool is
    /// exhausted and the request must be dropped.
    pub fn alloc_playsound(&mut self) -> Option<usize> {
        let sentinel = self.freeplays;
        let ps = self.playsounds[sentinel].next;
        if ps == sentinel {
            return None;
        }

        let prev = self.playsounds[ps].prev;
        let next = self.playsounds[ps].next;
        self.playsounds[prev].next = next;
        self.playsounds[next].prev = prev;

        Some(ps)
    }

    /// Unlink from whatever list the playsound is in and return it to
    /// the free list.
    pub fn free_playsound(&mut self, ps: usize) {
        let prev = self.playsounds[ps].prev;
        let next = self.playsounds[ps].next;
        self.playsounds[prev].next = next;
        self.playsounds[next].prev = prev;

        let sentinel = self.freeplays;
        let old_next = self.playsounds[sentinel].next;
        self.playsounds[ps].next = old_next;
        self.playsounds[old_next].prev = ps;
        self.playsounds[ps].prev = sentinel;
        self.playsounds[sentinel].next = ps;
    }

    /// Insert into the pending list, kept sorted ascending by begin
    /// time. The new entry lands before the first entry whose begin is
    /// not less than its own.
    fn link_pending(&mut self, ps: usize) {
        let begin = self.playsounds[ps].begin;
        let sentinel = self.pendingplays;

        let mut sort = self.playsounds[sentinel].next;
        while sort != sentinel && self.playsounds[sort].begin < begin {
            sort = self.playsounds[sort].next;
        }

        let prev = self.playsounds[sort].prev;
        self.playsounds[ps].next = sort;
        self.playsounds[ps].prev = prev;
        self.playsounds[sort].prev = ps;
        self.playsounds[prev].next = ps;
    }

    /// Reinitialize both lists: every pool slot onto the free list, the
    /// pending list empty.
    fn reset_playsounds(&mut self) {
        for ps in self.playsounds.iter_mut() {
            *ps = Playsound::default();
        }

        let free = self.freeplays;
        let pending = self.pendingplays;
        self.playsounds[free].next = free;
        self.playsounds[free].prev = free;
        self.playsounds[pending].next = pending;
        self.playsounds[pending].prev = pending;

        for i in 0..MAX_PLAYSOUNDS {
            let old_next = self.playsounds[free].next;
            self.playsounds[i].prev = free;
            self.playsounds[i].next = old_next;
            self.playsounds[old_next].prev = i;
            self.playsounds[free].next = i;
        }
    }

    /// Drift the persistent begin offset so sound starts stay loosely
    /// aligned with server time: never in the past, never unreasonably
    /// far ahead. A zero offset request starts immediately.
    fn drift_beginofs(&mut self, timeofs: f32, servertime: i32) -> i32 {
        let server_samples = (servertime as f32 * 0.001 * self.dma.speed as f32) as i32;
        let mut start = server_samples + self.beginofs;

        if start < self.paintedtime {
            start = self.paintedtime;
            self.beginofs = start - server_samples;
        } else if start > self.paintedtime + (0.3 * self.dma.speed as f32) as i32 {
            start = self.paintedtime + (0.1 * self.dma.speed as f32) as i32;
            self.beginofs = start - server_samples;
        } else {
            self.beginofs -= 10;
        }

        if timeofs != 0.0 {
            start + (timeofs * self.dma.speed as f32) as i32
        } else {
            self.paintedtime
        }
    }

    /// Validate the parms and queue the sound up. If `origin` is None,
    /// the sound will be dynamically sourced from the entity. Entchannel
    /// 0 never overrides a playing sound.
    pub fn start_sound(
        &mut self,
        origin: Option<&Vec3>,
        entnum: i32,
        entchannel: i32,
        sfx_idx: usize,
        fvol: f32,
        attenuation: f32,
        timeofs: f32,
        servertime: i32,
        loader: &mut dyn SampleLoader,
    ) {
        if self.started == SoundStarted::Not {
            return;
        }

        // make sure the sound is loaded
        if !loader.load(&mut self.known_sfx[sfx_idx]) || self.known_sfx[sfx_idx].cache.is_none() {
            return;
        }

        let ps = match self.alloc_playsound() {
            Some(ps) => ps,
            None => {
                // results in stuttering and cracking, worth noticing
                debug!("start_sound: no free playsounds");
                return;
            }
        };

        if let Some(orig) = origin {
            self.playsounds[ps].origin = *orig;
            self.playsounds[ps].fixed_origin = true;
        } else {
            self.playsounds[ps].fixed_origin = false;
        }

        self.playsounds[ps].entnum = entnum;
        self.playsounds[ps].entchannel = entchannel;
        self.playsounds[ps].attenuation = attenuation;
        self.playsounds[ps].volume = fvol * 255.0;
        self.playsounds[ps].sfx = Some(sfx_idx);

        self.playsounds[ps].begin = match self.started {
            SoundStarted::Dma => self.drift_beginofs(timeofs, servertime),
            _ => self.paintedtime + (timeofs * 1000.0) as i32,
        };

        self.link_pending(ps);
    }

    pub fn start_local_sound(
        &mut self,
        name: &str,
        playernum: i32,
        servertime: i32,
        loader: &mut dyn SampleLoader,
    ) {
        if self.started == SoundStarted::Not {
            return;
        }

        let sfx_idx = match self.register_sound(name, loader) {
            Some(idx) => idx,
            None => {
                warn!("start_local_sound: can't cache {}", name);
                return;
            }
        };
        self.start_sound(None, playernum + 1, 0, sfx_idx, 1.0, 1.0, 0.0, servertime, loader);
    }

    /// Take the next playsound and begin it on a channel. Only ever
    /// called from the update loop.
    fn issue_playsound(
        &mut self,
        ps_idx: usize,
        playernum: i32,
        get_entity_origin: &dyn Fn(i32) -> Vec3,
        loader: &mut dyn SampleLoader,
        mut accel: Option<&mut (dyn AccelBackend + '_)>,
    ) {
        if self.config.show {
            debug!("issue {}", self.playsounds[ps_idx].begin);
        }

        let ps = self.playsounds[ps_idx].clone();

        let sfx_idx = match ps.sfx {
            Some(idx) => idx,
            None => {
                self.free_playsound(ps_idx);
                return;
            }
        };

        // pick a channel to play on
        let ch_idx = match self.pick_channel(
            ps.entnum,
            ps.entchannel,
            playernum,
            accel.as_deref_mut(),
        ) {
            Some(idx) => idx,
            None => {
                self.free_playsound(ps_idx);
                return;
            }
        };

        if !loader.load(&mut self.known_sfx[sfx_idx]) || self.known_sfx[sfx_idx].cache.is_none() {
            warn!("issue_playsound: couldn't load {}", self.known_sfx[sfx_idx].name);
            self.free_playsound(ps_idx);
            return;
        }

        self.channels[ch_idx].dist_mult = if ps.attenuation == ATTN_STATIC {
            ps.attenuation * 0.001
        } else {
            ps.attenuation * 0.0005
        };
        self.channels[ch_idx].master_vol = ps.volume as i32;
        self.channels[ch_idx].entnum = ps.entnum;
        self.channels[ch_idx].entchannel = ps.entchannel;
        self.channels[ch_idx].sfx = Some(sfx_idx);
        self.channels[ch_idx].origin = ps.origin;
        self.channels[ch_idx].fixed_origin = ps.fixed_origin;

        match accel {
            Some(backend) => {
                if let Some(sc) = self.known_sfx[sfx_idx].cache.as_deref() {
                    backend.play_channel(ch_idx, &self.channels[ch_idx], sc, self.config.volume);
                }
            }
            None => self.spatialize(ch_idx, playernum, get_entity_origin),
        }

        let length = self.known_sfx[sfx_idx]
            .cache
            .as_deref()
            .map_or(0, |sc| sc.length);
        self.channels[ch_idx].pos = 0;
        self.channels[ch_idx].end = self.paintedtime + length;

        self.free_playsound(ps_idx);
    }

    /// Issue every pending playsound whose begin time has been reached,
    /// in ascending begin order.
    fn issue_due(
        &mut self,
        playernum: i32,
        get_entity_origin: &dyn Fn(i32) -> Vec3,
        loader: &mut dyn SampleLoader,
    ) {
        loop {
            let ps = self.playsounds[self.pendingplays].next;
            if ps == self.pendingplays || self.playsounds[ps].begin > self.paintedtime {
                break;
            }
            self.issue_playsound(ps, playernum, get_entity_origin, loader, None);
        }
    }

    // ============================================================
    // Stop / clear
    // ============================================================

    fn clear_buffer(&mut self, driver: &mut dyn DmaDriver, painter: &mut dyn SamplePainter) {
        self.rawend = 0;
        painter.clear(driver, &self.dma);
    }

    /// The one bulk-mutation path: both playsound lists and the channel
    /// array reinitialize together.
    pub fn stop_all_sounds(&mut self, output: &mut SoundOutput) {
        if self.started == SoundStarted::Not {
            return;
        }

        self.reset_playsounds();

        match output {
            SoundOutput::Accel(backend) => backend.stop_all(),
            SoundOutput::Dma { driver, painter } => {
                self.clear_buffer(driver.as_mut(), painter.as_mut())
            }
        }

        for ch in self.channels.iter_mut() {
            *ch = Channel::default();
        }
    }

    // ============================================================
    // Loop sounds
    // ============================================================

    /// Entities with a sound field generate looped sounds that are
    /// automatically started, stopped, and merged together as the
    /// entities are sent to the client.
    pub fn add_loop_sounds(&mut self, frame: &SoundFrame<'_>, playernum: i32) {
        if frame.paused || !frame.active || !frame.sound_prepped {
            return;
        }
        if self.config.ambient == AmbientMode::Off {
            return;
        }

        // per-entity sound list with the ambient filter applied
        let mut sounds: Vec<i32> = frame
            .entities
            .iter()
            .map(|ent| match self.config.ambient {
                AmbientMode::NoModelless if ent.modelindex == 0 => 0,
                AmbientMode::PlayerOnly if ent.number != playernum + 1 => 0,
                _ => ent.sound,
            })
            .collect();

        for i in 0..sounds.len() {
            if sounds[i] == 0 {
                continue;
            }

            let sfx_idx = match frame.sound_precache.get(sounds[i] as usize) {
                Some(Some(idx)) => *idx,
                _ => continue, // bad sound effect
            };
            if self.known_sfx[sfx_idx].cache.is_none() {
                continue; // not paged in yet
            }

            // total contribution of all sounds of this type
            let (mut left_total, mut right_total) =
                self.spatialize_origin(&frame.entities[i].origin, 255.0, SOUND_LOOPATTENUATE);

            for j in (i + 1)..sounds.len() {
                if sounds[j] != sounds[i] {
                    continue;
                }
                sounds[j] = 0; // don't check this again later

                let (left, right) =
                    self.spatialize_origin(&frame.entities[j].origin, 255.0, SOUND_LOOPATTENUATE);
                left_total += left;
                right_total += right;
            }

            if left_total == 0 && right_total == 0 {
                continue; // not audible
            }

            // allocate a channel
            let ch_idx = match self.pick_channel(0, 0, playernum, None) {
                Some(idx) => idx,
                None => return,
            };

            let length = self.known_sfx[sfx_idx]
                .cache
                .as_deref()
                .map_or(0, |sc| sc.length);

            let ch = &mut self.channels[ch_idx];
            ch.leftvol = left_total.min(255);
            ch.rightvol = right_total.min(255);
            ch.autosound = true; // remove next frame
            ch.sfx = Some(sfx_idx);

            // a zero-length cache would fault the modulo below
            if length == 0 {
                ch.pos = 0;
                ch.end = 0;
            } else {
                ch.pos = self.paintedtime % length;
                ch.end = self.paintedtime + length - ch.pos;
            }
        }
    }

    // ============================================================
    // Raw samples — cinematic streaming and voice over network
    // ============================================================

    /// Feed externally decoded PCM into the stream ring, resampled to
    /// the output rate by nearest-neighbor index scaling. Unsupported
    /// width/channel combinations are dropped.
    pub fn raw_samples(
        &mut self,
        samples: i32,
        rate: i32,
        width: i32,
        channels: i32,
        data: &[u8],
        volume: f32,
        output: &mut SoundOutput,
    ) {
        if self.started == SoundStarted::Not || samples <= 0 {
            return;
        }

        // stale stream data from before the current mix time never mixes
        if self.rawend < self.paintedtime {
            self.rawend = self.paintedtime;
        }

        if let SoundOutput::Accel(backend) = output {
            backend.raw_samples(samples, rate, width, channels, data, volume);
            return;
        }

        let scale = rate as f32 / self.dma.speed as f32;
        let mut intvolume = (256.0 * volume) as i32;
        let mask = MAX_RAW_SAMPLES as i32 - 1;

        match (channels, width) {
            (2, 2) => {
                let max_src = (data.len() / 4).min(samples as usize);
                for i in 0.. {
                    let src = (i as f32 * scale) as usize;
                    if src >= max_src {
                        break;
                    }
                    let dst = (self.rawend & mask) as usize;
                    self.rawend += 1;
                    self.rawsamples[dst].left =
                        i16::from_le_bytes([data[src * 4], data[src * 4 + 1]]) as i32 * intvolume;
                    self.rawsamples[dst].right =
                        i16::from_le_bytes([data[src * 4 + 2], data[src * 4 + 3]]) as i32
                            * intvolume;
                }
            }
            (1, 2) => {
                let max_src = (data.len() / 2).min(samples as usize);
                for i in 0.. {
                    let src = (i as f32 * scale) as usize;
                    if src >= max_src {
                        break;
                    }
                    let dst = (self.rawend & mask) as usize;
                    self.rawend += 1;
                    let s =
                        i16::from_le_bytes([data[src * 2], data[src * 2 + 1]]) as i32 * intvolume;
                    self.rawsamples[dst].left = s;
                    self.rawsamples[dst].right = s;
                }
            }
            (2, 1) => {
                intvolume *= 256;
                let max_src = (data.len() / 2).min(samples as usize);
                for i in 0.. {
                    let src = (i as f32 * scale) as usize;
                    if src >= max_src {
                        break;
                    }
                    let dst = (self.rawend & mask) as usize;
                    self.rawend += 1;
                    // 8 bit PCM is unsigned, centered on 128
                    self.rawsamples[dst].left = (data[src * 2] as i32 - 128) * intvolume;
                    self.rawsamples[dst].right = (data[src * 2 + 1] as i32 - 128) * intvolume;
                }
            }
            (1, 1) => {
                intvolume *= 256;
                let max_src = data.len().min(samples as usize);
                for i in 0.. {
                    let src = (i as f32 * scale) as usize;
                    if src >= max_src {
                        break;
                    }
                    let dst = (self.rawend & mask) as usize;
                    self.rawend += 1;
                    let s = (data[src] as i32 - 128) * intvolume;
                    self.rawsamples[dst].left = s;
                    self.rawsamples[dst].right = s;
                }
            }
            _ => {
                debug!(
                    "raw_samples: unsupported format, {} channels {} bytes wide",
                    channels, width
                );
            }
        }
    }

    // ============================================================
    // Mix clock
    // ============================================================

    /// Fold the device's wrapped sample position into a monotonic
    /// logical time. Returns true when the painted-time ceiling was hit
    /// and all playback state must be dropped.
    fn advance_soundtime(&mut self, samplepos: i32) -> bool {
        let fullsamples = self.dma.samples / self.dma.channels;
        let mut reset = false;

        // it is possible to miscount if the buffer wrapped twice between
        // polls; one wrap per poll is assumed
        if samplepos < self.oldsamplepos {
            self.buffers += 1; // buffer wrapped

            if self.paintedtime > PAINT_TIME_CEILING {
                // time to chop things off to avoid 32 bit limits
                self.buffers = 0;
                self.paintedtime = fullsamples;
                reset = true;
            }
        }

        self.oldsamplepos = samplepos;
        self.soundtime = self.buffers * fullsamples + samplepos / self.dma.channels;

        reset
    }

    // ============================================================
    // Per-frame update
    // ============================================================

    /// Called once each time through the main loop.
    pub fn update(
        &mut self,
        listener: &Listener,
        frame: &SoundFrame<'_>,
        playernum: i32,
        get_entity_origin: &dyn Fn(i32) -> Vec3,
        loader: &mut dyn SampleLoader,
        output: &mut SoundOutput,
    ) {
        if self.started == SoundStarted::Not {
            return;
        }

        // if the loading plaque is up, clear everything out so a dirty
        // buffer doesn't loop while loading
        if frame.loading {
            if let SoundOutput::Dma { driver, painter } = output {
                self.clear_buffer(driver.as_mut(), painter.as_mut());
            }
            return;
        }

        self.listener = *listener;
        self.active = frame.active;

        match output {
            SoundOutput::Accel(backend) => {
                backend.update_listener(&self.listener);

                // the backend owns start timing; hand everything over
                loop {
                    let ps = self.playsounds[self.pendingplays].next;
                    if ps == self.pendingplays {
                        break;
                    }
                    self.issue_playsound(
                        ps,
                        playernum,
                        get_entity_origin,
                        loader,
                        Some(backend.as_mut()),
                    );
                }

                backend.update();
            }
            SoundOutput::Dma { driver, painter } => {
                self.update_dma(
                    driver.as_mut(),
                    painter.as_mut(),
                    frame,
                    playernum,
                    get_entity_origin,
                    loader,
                );
            }
        }
    }

    fn update_dma(
        &mut self,
        driver: &mut dyn DmaDriver,
        painter: &mut dyn SamplePainter,
        frame: &SoundFrame<'_>,
        playernum: i32,
        get_entity_origin: &dyn Fn(i32) -> Vec3,
        loader: &mut dyn SampleLoader,
    ) {
        if self.volume_modified {
            painter.set_volume(self.config.volume);
            self.volume_modified = false;
        }

        // updates DMA time
        let samplepos = driver.sample_position();
        if self.advance_soundtime(samplepos) {
            self.reset_playsounds();
            for ch in self.channels.iter_mut() {
                *ch = Channel::default();
            }
            self.clear_buffer(driver, painter);
        }

        if self.soundtime == 0 {
            return; // device hasn't consumed anything yet
        }

        // check to make sure we haven't overshot
        if self.paintedtime < self.soundtime {
            debug!(
                "sound update overflow: painted {} < device {}",
                self.paintedtime, self.soundtime
            );
            self.paintedtime = self.soundtime;
        }

        // update spatialization for dynamic sounds, reclaim dead channels
        for i in 0..MAX_CHANNELS {
            if self.channels[i].sfx.is_none() {
                continue;
            }

            if self.channels[i].autosound {
                // autosounds are regenerated fresh each frame
                self.channels[i] = Channel::default();
                continue;
            }

            self.spatialize(i, playernum, get_entity_origin); // respatialize channel
            if self.channels[i].leftvol == 0 && self.channels[i].rightvol == 0 {
                self.channels[i] = Channel::default();
                continue;
            }

            if self.paintedtime >= self.channels[i].end {
                // looped sounds wrap and carry on; one-shots are done
                let wrapped = self.channels[i].sfx.and_then(|sfx_idx| {
                    self.known_sfx[sfx_idx]
                        .cache
                        .as_deref()
                        .filter(|sc| sc.loopstart >= 0 && sc.length > 0)
                        .map(|sc| sc.length)
                });
                match wrapped {
                    Some(length) => {
                        self.channels[i].pos = self.paintedtime % length;
                        self.channels[i].end =
                            self.paintedtime + length - self.channels[i].pos;
                    }
                    None => {
                        self.channels[i] = Channel::default();
                        continue;
                    }
                }
            }
        }

        // add loopsounds
        self.add_loop_sounds(frame, playernum);

        // issue playsounds that have come due
        self.issue_due(playernum, get_entity_origin, loader);

        // debugging output
        if self.config.show {
            let mut total = 0;
            for ch in &self.channels {
                if let Some(sfx_idx) = ch.sfx {
                    if ch.leftvol != 0 || ch.rightvol != 0 {
                        debug!(
                            "{:3} {:3} {}",
                            ch.leftvol, ch.rightvol, self.known_sfx[sfx_idx].name
                        );
                        total += 1;
                    }
                }
            }
            debug!("----({})---- painted: {}", total, self.paintedtime);
        }

        // mix ahead of the current device position
        let mut endtime = self.soundtime + (self.config.mixahead * self.dma.speed as f32) as i32;

        // mix to an even submission block size
        endtime = (endtime + self.dma.submission_chunk - 1) & !(self.dma.submission_chunk - 1);

        // never more than one full buffer ahead
        let samps = self.dma.samples >> (self.dma.channels - 1);
        if endtime - self.soundtime > samps {
            endtime = self.soundtime + samps;
        }

        driver.begin_painting();
        painter.paint(
            driver,
            PaintView {
                channels: &mut self.channels,
                known_sfx: &self.known_sfx,
                rawsamples: &self.rawsamples,
                rawend: self.rawend,
                paintedtime: self.paintedtime,
            },
            endtime,
        );
        // the paint loop only ever moves forward
        if endtime > self.paintedtime {
            self.paintedtime = endtime;
        }
        driver.submit();
    }

    // ============================================================
    // Diagnostics
    // ============================================================

    pub fn sound_info(&self) {
        if self.started == SoundStarted::Not {
            info!("sound system not started");
            return;
        }

        info!("{:5} stereo", self.dma.channels - 1);
        info!("{:5} samples", self.dma.samples);
        info!("{:5} samplebits", self.dma.samplebits);
        info!("{:5} submission_chunk", self.dma.submission_chunk);
        info!("{:5} speed", self.dma.speed);
    }

    pub fn sound_list(&self) {
        let mut total = 0;
        let mut numsounds = 0;

        for sfx in &self.known_sfx[..self.num_sfx] {
            if sfx.name.is_empty() {
                continue;
            }

            if let Some(sc) = sfx.cache.as_deref() {
                let size = sc.length * sc.width * (sc.stereo + 1);
                total += size;
                info!(
                    "{}({:2}b) {:8} : {}",
                    if sc.loopstart != -1 { "L" } else { " " },
                    sc.width * 8,
                    size,
                    sfx.name
                );
            } else if sfx.name.starts_with('*') {
                info!("    placeholder : {}", sfx.name);
            } else {
                info!("    not loaded  : {}", sfx.name);
            }
            numsounds += 1;
        }

        info!("Total resident: {} bytes in {} sounds", total, numsounds);
    }

    /// Start each named sound locally, the way the console command does.
    pub fn play_sounds(
        &mut self,
        names: &[&str],
        playernum: i32,
        servertime: i32,
        loader: &mut dyn SampleLoader,
    ) {
        for arg in names {
            let name = if !arg.contains('.') {
                format!("{}.wav", arg)
            } else {
                (*arg).to_string()
            };

            if name.contains("..") || name.starts_with('/') || name.starts_with('\\') {
                warn!("bad sound filename {}", name);
                continue;
            }

            if let Some(sfx_idx) = self.register_sound(&name, loader) {
                self.start_sound(
                    None,
                    playernum + 1,
                    0,
                    sfx_idx,
                    1.0,
                    1.0,
                    0.0,
                    servertime,
                    loader,
                );
            }
        }
    }
}
