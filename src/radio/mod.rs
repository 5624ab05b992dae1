//! The radio program: station selection logic layered on top of a
//! [`Scheduler`], driven as a [`crate::coroutine`].
//!
//! This is a close translation of `Radio` from the original implementation
//! (pool selection with no-repeat trimming, the `go_soft` segue, the
//! music/break/id/solo segment generators, the top-level loop), rewritten
//! as plain sequential code: every former `yield seconds` is a
//! [`Waiter::wait`] call, since the whole program body runs on one
//! dedicated thread for the lifetime of the station.

pub mod definitions;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use chrono::Timelike;

use crate::coroutine::{self, Waiter};
use crate::file_source::FileSource;
use crate::normalize::Normalize;
use crate::scheduler::Scheduler;
use crate::source::{self, Source};
use definitions::{Definitions, MusicEntry};

/// Metadata describing the segment currently playing on the `music`
/// sub-scheduler, surfaced via [`emit_metadata`].
#[derive(Debug, Clone)]
pub struct Metadata {
    pub title: String,
    pub artist: Option<String>,
}

enum BreakKind {
    Ad,
    News,
}

/// Station program state: loaded definitions, MRU no-repeat history, and
/// the tuning knobs the original hardcodes on `Radio.__init__`.
pub struct Radio {
    definition_files: Vec<PathBuf>,
    extension: String,
    meta_url: Option<String>,
    target_lufs: f64,
    padding: f64,
    over_volume: f32,
    no_repeat_percent: f64,
    intro_chance: f64,
    defs: Definitions,
    mru: HashMap<String, VecDeque<String>>,
}

impl Radio {
    /// Load `definition_files` for the first time. Unlike [`Radio::reload`],
    /// a failure here is fatal and propagated to the caller.
    pub fn new(
        definition_files: Vec<PathBuf>,
        extension: String,
        meta_url: Option<String>,
        target_lufs: f64,
    ) -> Result<Self, crate::error::ConfigError> {
        let defs = definitions::load(&definition_files, &extension)?;
        Ok(Self {
            definition_files,
            extension,
            meta_url,
            target_lufs,
            padding: 0.5,
            over_volume: 0.5,
            no_repeat_percent: 0.5,
            intro_chance: 0.5,
            defs,
            mru: HashMap::new(),
        })
    }

    /// Re-read the station definitions. A failure here is logged and the
    /// previously-loaded definitions are kept, so a bad edit to a running
    /// station's YAML doesn't take the station down.
    fn reload(&mut self) {
        match definitions::load(&self.definition_files, &self.extension) {
            Ok(defs) => self.defs = defs,
            Err(e) => log::error!("error while reloading definitions: {e}"),
        }
    }

    fn pool(&self, key: &str) -> &[PathBuf] {
        match key {
            "id" => &self.defs.id,
            "solo" => &self.defs.solo,
            "to-ad" => &self.defs.to_ad,
            "to-news" => &self.defs.to_news,
            "time-morning" => &self.defs.time_morning,
            "time-evening" => &self.defs.time_evening,
            "general" => &self.defs.general,
            "ad" => &self.defs.ad,
            "news" => &self.defs.news,
            _ => &[],
        }
    }

    /// Pick an index from `items` under MRU no-repeat trimming: at most
    /// `floor(items.len() * no_repeat_percent)` identities are remembered;
    /// if every remaining item is in that window, the oldest remembered
    /// identity is re-admitted (and only items sharing it are reconsidered)
    /// rather than returning nothing.
    fn choice_index<T>(
        &mut self,
        key: &str,
        items: &[T],
        identity: impl Fn(&T) -> &str,
    ) -> Option<usize> {
        if items.is_empty() {
            return None;
        }

        let no_repeat = (items.len() as f64 * self.no_repeat_percent) as usize;
        let used = self.mru.entry(key.to_string()).or_default();
        while used.len() > no_repeat {
            used.pop_back();
        }

        let mut eligible: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, m)| !used.contains(&identity(m).to_string()))
            .map(|(i, _)| i)
            .collect();

        while eligible.is_empty() {
            let k = used.pop_back()?;
            eligible = items
                .iter()
                .enumerate()
                .filter(|(_, m)| identity(m) == k)
                .map(|(i, _)| i)
                .collect();
        }

        let idx = *eligible.choose(&mut rand::thread_rng())?;
        used.push_front(identity(&items[idx]).to_string());
        Some(idx)
    }

    fn choice_path(&mut self, key: &str) -> Option<PathBuf> {
        let pool = self.pool(key).to_vec();
        let idx = self.choice_index(key, &pool, |p| p.to_str().unwrap_or(""))?;
        Some(pool[idx].clone())
    }

    fn choice_music(&mut self) -> Option<MusicEntry> {
        let pool = self.defs.music.clone();
        let idx = self.choice_index("music", &pool, |m| m.path.to_str().unwrap_or(""))?;
        Some(pool[idx].clone())
    }

    /// Open, reformat and loudness-normalize a track for playback at
    /// `target_rate`/`target_channels`.
    fn open_track(
        &self,
        path: &Path,
        target_rate: u32,
        target_channels: usize,
    ) -> std::io::Result<Box<dyn Source>> {
        let file: Box<dyn Source> = Box::new(FileSource::open(path)?);
        let reformatted = source::reformat(file, target_rate, target_channels)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Box::new(Normalize::new(reformatted, self.target_lufs)))
    }

    /// The segue at the heart of the station: schedule `main_path` onto
    /// `music` starting at `soft_time` (or later, if an over-talk clip
    /// needs a break to fit), optionally ducking under an `over_path` clip
    /// on `talk`. Returns how much of this segment's tail overlaps with
    /// whatever gets scheduled next.
    #[allow(clippy::too_many_arguments)]
    fn go_soft(
        &mut self,
        music: &Scheduler,
        talk: &Scheduler,
        waiter: &Waiter,
        soft_time: f64,
        main_path: Option<&Path>,
        over_path: Option<&Path>,
        meta: Metadata,
        pre: f64,
        post: Option<f64>,
        force: bool,
    ) -> f64 {
        let main_path = match main_path {
            Some(p) => p,
            None => return soft_time,
        };

        let main = match self.open_track(main_path, music.samplerate(), music.channels()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to open {}: {e}", main_path.display());
                return soft_time;
            }
        };

        let over = match over_path {
            Some(p) => match self.open_track(p, talk.samplerate(), talk.channels()) {
                Ok(s) => Some(s),
                Err(e) => {
                    log::error!("failed to open {}: {e}", p.display());
                    None
                }
            },
            None => None,
        };

        let (mut over_start_time, mut skip_over) = match &over {
            Some(o) => match o.size() {
                Some(frames) => {
                    let over_seconds = frames as f64 / o.samplerate() as f64;
                    (pre - (over_seconds + 2.0 * self.padding), false)
                }
                // an over clip of unknown length can't be positioned safely --
                // assuming zero duration would duck back immediately, so this
                // degrades the same as having no over clip at all.
                None => {
                    log::warn!("over clip has unknown duration, skipping segue over it");
                    (0.0, true)
                }
            },
            None => (0.0, true),
        };

        let main_start = if soft_time >= -over_start_time {
            soft_time
        } else if force {
            -over_start_time
        } else {
            skip_over = true;
            soft_time
        };
        over_start_time += main_start;

        let station_name = self.defs.name.clone();
        let meta_url = self.meta_url.clone();
        let md = music.add_source(main_start, main);
        music.add_callback(
            main_start,
            Box::new(move |_| {
                emit_metadata(station_name.as_deref(), meta_url.as_deref(), &meta);
            }),
        );

        let post = post.unwrap_or_else(|| {
            md.unwrap_or_else(|| {
                log::warn!("main track has unknown duration, treating post-overlap budget as zero");
                0.0
            })
        });

        if skip_over {
            waiter.wait(main_start + post);
        } else if let Some(over) = over {
            music.set_volume(over_start_time, self.over_volume, self.padding);
            let od = talk
                .add_source(over_start_time + self.padding, over)
                .unwrap_or(0.0);
            waiter.wait(over_start_time + self.padding + od);
            music.set_volume(0.0, 1.0, self.padding);
            waiter.wait(main_start + post - (over_start_time + self.padding + od));
        }

        md.unwrap_or_else(|| {
            log::warn!("main track has unknown duration, reporting zero soft_time to the caller");
            0.0
        }) - post
    }

    fn go_break(
        &mut self,
        music: &Scheduler,
        talk: &Scheduler,
        waiter: &Waiter,
        soft_time: f64,
        main_key: &str,
        over_key: &str,
        title: &str,
    ) -> f64 {
        let ad = self.choice_path(main_key);
        let over = self.choice_path(over_key);
        let meta = Metadata {
            title: title.to_string(),
            artist: None,
        };
        match ad {
            Some(ad) => self.go_soft(
                music,
                talk,
                waiter,
                soft_time,
                Some(&ad),
                over.as_deref(),
                meta,
                0.0,
                None,
                true,
            ),
            None => soft_time,
        }
    }

    fn go_id(&mut self, music: &Scheduler, talk: &Scheduler, waiter: &Waiter, soft_time: f64) -> f64 {
        let id = self.choice_path("id");
        let meta = Metadata {
            title: "Identification".to_string(),
            artist: None,
        };
        self.go_soft(music, talk, waiter, soft_time, id.as_deref(), None, meta, 0.0, None, false)
    }

    fn go_solo(&mut self, music: &Scheduler, talk: &Scheduler, waiter: &Waiter, soft_time: f64) -> f64 {
        let solo = self.choice_path("solo");
        let meta = Metadata {
            title: "Monologue".to_string(),
            artist: None,
        };
        self.go_soft(music, talk, waiter, soft_time, solo.as_deref(), None, meta, 0.0, None, false)
    }

    fn go_music(&mut self, music: &Scheduler, talk: &Scheduler, waiter: &Waiter, soft_time: f64) -> f64 {
        self.reload();

        let m = match self.choice_music() {
            Some(m) => m,
            None => return soft_time,
        };

        let intro_path = if rand::random::<f64>() < self.intro_chance {
            let mut choices: Vec<PathBuf> = Vec::new();
            if let Some(p) = self.choice_path("general") {
                choices.push(p);
            }
            let hour = chrono::Local::now().hour();
            if (4..12).contains(&hour) {
                if let Some(p) = self.choice_path("time-morning") {
                    choices.push(p);
                }
            }
            if (17..24).contains(&hour) {
                if let Some(p) = self.choice_path("time-evening") {
                    choices.push(p);
                }
            }
            if let Some(p) = m.intro.choose(&mut rand::thread_rng()) {
                choices.push(p.clone());
            }
            choices.choose(&mut rand::thread_rng()).cloned()
        } else {
            None
        };

        let meta = Metadata {
            title: m.title.clone(),
            artist: Some(m.artist.clone()),
        };

        self.go_soft(
            music,
            talk,
            waiter,
            soft_time,
            Some(&m.path),
            intro_path.as_deref(),
            meta,
            m.pre,
            Some(m.post),
            false,
        )
    }

    /// The station's main loop: twelve songs, a break (alternating ad and
    /// news), an ID, a solo monologue, repeated forever. Call via
    /// [`Radio::spawn`], never directly -- `waiter` only makes sense from
    /// inside the program's own dedicated thread.
    fn go(&mut self, root: &Scheduler, waiter: &Waiter) {
        let music = root.subscheduler();
        let talk = root.subscheduler();

        let mut soft_time = 0.0;
        loop {
            for kind in [BreakKind::Ad, BreakKind::News] {
                for _ in 0..12 {
                    soft_time = self.go_music(&music, &talk, waiter, soft_time);
                    waiter.wait(self.padding);
                }
                soft_time = match kind {
                    BreakKind::Ad => self.go_break(&music, &talk, waiter, soft_time, "ad", "to-ad", "Advertisement"),
                    BreakKind::News => self.go_break(&music, &talk, waiter, soft_time, "news", "to-news", "News"),
                };
                waiter.wait(self.padding);
                soft_time = self.go_id(&music, &talk, waiter, soft_time);
                waiter.wait(self.padding);
                soft_time = self.go_solo(&music, &talk, waiter, soft_time);
                waiter.wait(self.padding);
            }
        }
    }

    /// Start the station's program as a coroutine driven by `root`. Takes
    /// ownership of `self`: the whole program runs on its own thread for
    /// the rest of the process.
    pub fn spawn(mut self, root: Scheduler) {
        let driver = root.clone();
        coroutine::spawn(&driver, move |waiter| {
            self.go(&root, waiter);
        });
    }
}

/// Print (and, if configured, POST) now-playing metadata. A free function
/// rather than a `Radio` method: it runs from inside a scheduler callback
/// on the audio-driving thread, not the program thread that owns `Radio`,
/// so it captures only the small owned values it needs.
pub fn emit_metadata(station_name: Option<&str>, meta_url: Option<&str>, meta: &Metadata) {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(name) = station_name {
        parts.push(name);
    }
    if let Some(artist) = &meta.artist {
        parts.push(artist);
    }
    parts.push(&meta.title);
    let song = if parts.is_empty() {
        "NO INFORMATION".to_string()
    } else {
        parts.join(" - ")
    };

    println!("### {song}");

    if let Some(meta_url) = meta_url {
        let url = set_query_param(meta_url, "song", &song);
        if let Err(e) = ureq::get(&url).call() {
            log::warn!("failed to set metadata via url: {e}");
        }
    }
}

/// Build `url` with `key=value` set in its query string, replacing any
/// existing parameter of that name rather than appending a duplicate --
/// `ureq`'s own `.query()` always appends, which would leave a station's
/// pre-existing `song=` parameter in place alongside the new one instead of
/// overriding it.
fn set_query_param(url: &str, key: &str, value: &str) -> String {
    let (base, query) = url.split_once('?').unwrap_or((url, ""));

    let mut pairs: Vec<(&str, Option<&str>)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (p, None),
        })
        .filter(|(k, _)| *k != key)
        .collect();

    let encoded = percent_encode_query_value(value);
    pairs.push((key, Some(encoded.as_str())));

    let query = pairs
        .into_iter()
        .map(|(k, v)| match v {
            Some(v) => format!("{k}={v}"),
            None => k.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");

    format!("{base}?{query}")
}

fn percent_encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn radio_for_test() -> Radio {
        Radio {
            definition_files: Vec::new(),
            extension: "ogg".into(),
            meta_url: None,
            target_lufs: -14.0,
            padding: 0.5,
            over_volume: 0.5,
            no_repeat_percent: 0.5,
            intro_chance: 0.5,
            defs: Definitions::default(),
            mru: HashMap::new(),
        }
    }

    #[test]
    fn choice_index_avoids_recently_picked_identities() {
        let mut radio = radio_for_test();
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let first = radio.choice_index("k", &items, |s| s.as_str()).unwrap();
        let used = radio.mru.get("k").unwrap().clone();
        assert_eq!(used.front().unwrap(), &items[first]);

        for _ in 0..20 {
            let idx = radio.choice_index("k", &items, |s| s.as_str()).unwrap();
            // no_repeat = floor(4 * 0.5) = 2: the two most recent picks
            // must never repeat immediately.
            let used = radio.mru.get("k").unwrap();
            assert!(used.len() <= 2 || used.iter().take(2).filter(|u| **u == items[idx]).count() <= 1);
        }
    }

    #[test]
    fn choice_index_degrades_gracefully_when_pool_barely_exceeds_window() {
        let mut radio = radio_for_test();
        let items = vec!["a".to_string(), "b".to_string()];
        // with no_repeat_percent = 0.5 and 2 items, no_repeat = 1: after one
        // pick the window can still hold every remaining identity once the
        // trim runs, forcing the re-admission path.
        for _ in 0..10 {
            assert!(radio.choice_index("k", &items, |s| s.as_str()).is_some());
        }
    }

    #[test]
    fn choice_index_on_empty_pool_returns_none() {
        let mut radio = radio_for_test();
        let items: Vec<String> = Vec::new();
        assert_eq!(radio.choice_index("k", &items, |s| s.as_str()), None);
    }

    #[test]
    fn choice_path_on_unknown_pool_key_returns_none() {
        let mut radio = radio_for_test();
        assert_eq!(radio.choice_path("not-a-real-pool"), None);
    }

    fn write_tone(dir: &std::path::Path, stem: &str, sr: u32, seconds: f64) -> PathBuf {
        let path = dir.join(format!("{stem}.wav"));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sr,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        let n = (sr as f64 * seconds) as usize;
        for i in 0..n {
            let t = i as f64 / sr as f64;
            let s = (2.0 * std::f64::consts::PI * 220.0 * t).sin() as f32 * 0.3;
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "driveradio-gosoft-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn first_nonzero_frame(buf: &[f32]) -> Option<usize> {
        buf.iter().position(|&s| s.abs() > 1e-4)
    }

    /// spec.md §8 scenario 1 ("seamless segue"): `soft_time = 5`, `pre = 4`,
    /// an over-talk clip of duration 2 (`od`), `padding = 0.5`. Expected:
    /// `over_start_time = 4 - (2 + 1) = 1`; since `5 >= -1`, `main_start =
    /// 5` and `over_start_time` becomes `6`; music ducks 1.0 -> 0.5 over
    /// `[6, 6.5]` and back 0.5 -> 1.0 over `[8.5, 9.0]`.
    #[test]
    fn go_soft_schedules_seamless_segue_volume_ramp_per_scenario_one() {
        let dir = scratch_dir("seamless");
        let main_path = write_tone(&dir, "main", 2000, 6.0);
        let over_path = write_tone(&dir, "over", 2000, 2.0);

        let mut radio = radio_for_test();
        let root = Scheduler::new(2000, 1);
        let music = root.subscheduler();
        let talk = root.subscheduler();
        let music_probe = music.clone();

        let meta = Metadata { title: "B".into(), artist: None };
        coroutine::spawn(&root.clone(), move |waiter| {
            radio.go_soft(
                &music, &talk, waiter, 5.0, Some(&main_path), Some(&over_path), meta, 4.0,
                Some(2.0), false,
            );
        });

        // the ramp down is already scheduled by the time the body hits its
        // first `wait()`, which this call blocks until.
        assert!((music_probe.get_volume(6.0) - 1.0).abs() < 1e-6);
        assert!((music_probe.get_volume(6.25) - 0.75).abs() < 0.05);
        assert!((music_probe.get_volume(6.5) - 0.5).abs() < 1e-6);

        // advance the driving scheduler past the over-talk clip so the body
        // resumes and schedules the ramp back up.
        let mut root = root;
        root.allocate(2000 * 10);
        let _ = root.fill(Some(2000 * 10));

        assert!((music_probe.get_volume(8.5) - 0.5).abs() < 1e-6);
        assert!((music_probe.get_volume(8.75) - 0.75).abs() < 0.05);
        assert!((music_probe.get_volume(9.0) - 1.0).abs() < 1e-6);
    }

    /// spec.md §8 scenario 2 ("forced break"): `soft_time = 0`, `pre = 0`,
    /// `od = 3`, `padding = 0.5`, `force = true`. Expected:
    /// `over_start_time = 0 - (3 + 1) = -4`; `0 >= 4` is false, so
    /// `main_start = 4` and `over_start_time` becomes `0`; 4s of silence
    /// precede the ad, the voice-over runs `[0.5, 3.5]`.
    #[test]
    fn go_soft_forces_the_break_per_scenario_two() {
        let dir = scratch_dir("forced");
        let ad_path = write_tone(&dir, "ad", 2000, 6.0);
        let over_path = write_tone(&dir, "over", 2000, 3.0);

        let mut radio = radio_for_test();
        let root = Scheduler::new(2000, 1);
        let mut music = root.subscheduler();
        let mut talk = root.subscheduler();
        let body_music = music.clone();
        let body_talk = talk.clone();

        let meta = Metadata { title: "Ad".into(), artist: None };
        coroutine::spawn(&root, move |waiter| {
            radio.go_soft(
                &body_music, &body_talk, waiter, 0.0, Some(&ad_path), Some(&over_path), meta, 0.0,
                Some(0.0), true,
            );
        });

        let frames = 2000 * 8;
        music.allocate(frames);
        let music_out = music.fill(Some(frames)).to_vec();
        talk.allocate(frames);
        let talk_out = talk.fill(Some(frames)).to_vec();

        let ad_start = first_nonzero_frame(&music_out).expect("ad should play");
        assert!((ad_start as f64 - 2000.0 * 4.0).abs() <= 2.0);

        let over_start = first_nonzero_frame(&talk_out).expect("voice-over should play");
        assert!((over_start as f64 - 2000.0 * 0.5).abs() <= 2.0);
    }

    /// spec.md §8 scenario 3 ("skip-over fallback"): identical inputs to
    /// scenario 2 but `force = false`, so the `5 >= -1`-style check fails,
    /// `force` doesn't save it, and the over-talk clip is dropped entirely:
    /// the music starts exactly at `soft_time`, with nothing on `talk`.
    #[test]
    fn go_soft_skips_the_over_talk_per_scenario_three() {
        let dir = scratch_dir("skipover");
        let ad_path = write_tone(&dir, "ad", 2000, 3.0);
        let over_path = write_tone(&dir, "over", 2000, 3.0);

        let mut radio = radio_for_test();
        let root = Scheduler::new(2000, 1);
        let mut music = root.subscheduler();
        let mut talk = root.subscheduler();
        let body_music = music.clone();
        let body_talk = talk.clone();

        let meta = Metadata { title: "Ad".into(), artist: None };
        coroutine::spawn(&root, move |waiter| {
            radio.go_soft(
                &body_music, &body_talk, waiter, 0.0, Some(&ad_path), Some(&over_path), meta, 0.0,
                Some(0.0), false,
            );
        });

        let frames = 2000 * 4;
        music.allocate(frames);
        let music_out = music.fill(Some(frames)).to_vec();
        talk.allocate(frames);
        let talk_out = talk.fill(Some(frames)).to_vec();

        let ad_start = first_nonzero_frame(&music_out).expect("ad should play");
        assert!(ad_start <= 2);
        assert!(first_nonzero_frame(&talk_out).is_none(), "over-talk must not play when skipped");
    }

    #[test]
    fn go_soft_with_no_main_path_returns_soft_time_unchanged() {
        let mut radio = radio_for_test();
        let root = Scheduler::new(2000, 1);
        let music = root.subscheduler();
        let talk = root.subscheduler();
        let meta = Metadata { title: "X".into(), artist: None };

        let (tx, rx) = crossbeam_channel::bounded(1);
        coroutine::spawn(&root, move |waiter| {
            let result = radio.go_soft(&music, &talk, waiter, 3.5, None, None, meta, 0.0, None, false);
            let _ = tx.send(result);
        });

        assert_eq!(rx.recv().unwrap(), 3.5);
    }

    #[test]
    fn emit_metadata_formats_station_artist_title() {
        // emit_metadata only prints/POSTs; this confirms it doesn't panic
        // across the no-metadata and full-metadata shapes.
        emit_metadata(None, None, &Metadata { title: "Song".into(), artist: None });
        emit_metadata(
            Some("Station"),
            None,
            &Metadata {
                title: "Song".into(),
                artist: Some("Artist".into()),
            },
        );
    }

    #[test]
    fn set_query_param_appends_to_a_bare_url() {
        let url = set_query_param("http://example.com/meta", "song", "Station - Artist - X");
        assert_eq!(url, "http://example.com/meta?song=Station+-+Artist+-+X");
    }

    #[test]
    fn set_query_param_overrides_an_existing_song_while_preserving_others() {
        let url = set_query_param(
            "http://example.com/meta?id=42&song=stale&format=json",
            "song",
            "Station - Artist - X",
        );
        assert_eq!(url, "http://example.com/meta?id=42&format=json&song=Station+-+Artist+-+X");
    }

    /// A minimal single-request HTTP/1.1 listener: accepts one connection,
    /// captures its request line, and replies `200 OK`. Stands in for a
    /// mocking crate the dependency stack doesn't carry, to drive
    /// `emit_metadata`'s real `ureq::get` call against spec.md §8 scenario 6.
    fn capture_one_request_line() -> (std::net::SocketAddr, std::sync::mpsc::Receiver<String>) {
        use std::io::{BufRead, BufReader, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                let _ = reader.read_line(&mut request_line);
                let _ = tx.send(request_line.trim().to_string());
                let mut stream = stream;
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
            }
        });

        (addr, rx)
    }

    #[test]
    fn emit_metadata_posts_song_with_url_encoding_on_a_plain_meta_url() {
        let (addr, rx) = capture_one_request_line();
        let meta_url = format!("http://{addr}/meta");

        emit_metadata(
            Some("Station"),
            Some(&meta_url),
            &Metadata {
                title: "X".into(),
                artist: Some("Artist".into()),
            },
        );

        let request_line = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert!(request_line.starts_with("GET /meta?song=Station+-+Artist+-+X "));
    }

    #[test]
    fn emit_metadata_overrides_a_preexisting_song_param_on_the_meta_url() {
        let (addr, rx) = capture_one_request_line();
        let meta_url = format!("http://{addr}/meta?listener=123&song=old-song");

        emit_metadata(
            Some("Station"),
            Some(&meta_url),
            &Metadata {
                title: "X".into(),
                artist: Some("Artist".into()),
            },
        );

        let request_line = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert!(request_line.starts_with("GET /meta?listener=123&song=Station+-+Artist+-+X "));
        assert!(!request_line.contains("old-song"), "stale song param must not survive: {request_line}");
        assert_eq!(request_line.matches("song=").count(), 1, "song must appear exactly once: {request_line}");
    }
}
