//! Station definition files: strict YAML describing pools of music and
//! voice-over clips.
//!
//! Unknown keys are fatal, matching the original loader's strictness; this
//! version additionally supports `include` (sibling files merged in,
//! depth-first, with cycle detection) and validates the `intro` pool against
//! `music` entries.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

const DEF_KEYS: &[&str] = &[
    "name",
    "prefix",
    "include",
    "id",
    "solo",
    "to-ad",
    "to-news",
    "time-morning",
    "time-evening",
    "general",
    "ad",
    "news",
    "intro",
    "music",
];

const MUSIC_KEYS: &[&str] = &["path", "title", "artist", "album", "intro", "pre", "post"];
const MUSIC_REQUIRED_KEYS: &[&str] = &["path", "title", "artist", "pre", "post"];

const INTRO_KEYS: &[&str] = &["path", "title", "artist", "album"];
const INTRO_REQUIRED_KEYS: &[&str] = &["path", "title", "artist"];

/// A resolved music-pool entry: an instrumental+vocal track that can be
/// played as the "main" of a segment.
#[derive(Debug, Clone)]
pub struct MusicEntry {
    pub path: PathBuf,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub pre: f64,
    pub post: f64,
    /// Paths of voice-over clips eligible to introduce this song, merged
    /// from its own inline `intro` field and any flat `intro` pool entries
    /// that match it on (title, artist, album).
    pub intro: Vec<PathBuf>,
}

/// The fully merged, resolved station layout.
#[derive(Debug, Default, Clone)]
pub struct Definitions {
    pub name: Option<String>,
    pub id: Vec<PathBuf>,
    pub solo: Vec<PathBuf>,
    pub to_ad: Vec<PathBuf>,
    pub to_news: Vec<PathBuf>,
    pub time_morning: Vec<PathBuf>,
    pub time_evening: Vec<PathBuf>,
    pub general: Vec<PathBuf>,
    pub ad: Vec<PathBuf>,
    pub news: Vec<PathBuf>,
    pub music: Vec<MusicEntry>,
}

impl Definitions {
    /// All paths referenced anywhere in these definitions, for `lint`.
    pub fn all_paths(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = Vec::new();
        for pool in [
            &self.id,
            &self.solo,
            &self.to_ad,
            &self.to_news,
            &self.time_morning,
            &self.time_evening,
            &self.general,
            &self.ad,
            &self.news,
        ] {
            paths.extend(pool.iter().map(PathBuf::as_path));
        }
        for m in &self.music {
            paths.push(&m.path);
            paths.extend(m.intro.iter().map(PathBuf::as_path));
        }
        paths
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawMusic {
    path: String,
    title: String,
    artist: String,
    album: Option<String>,
    intro: Option<String>,
    pre: String,
    post: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawIntro {
    path: String,
    title: String,
    artist: String,
    album: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawFile {
    name: Option<String>,
    prefix: Option<String>,
    include: Option<Vec<String>>,
    id: Option<Vec<String>>,
    solo: Option<Vec<String>>,
    #[serde(rename = "to-ad")]
    to_ad: Option<Vec<String>>,
    #[serde(rename = "to-news")]
    to_news: Option<Vec<String>>,
    #[serde(rename = "time-morning")]
    time_morning: Option<Vec<String>>,
    #[serde(rename = "time-evening")]
    time_evening: Option<Vec<String>>,
    general: Option<Vec<String>>,
    ad: Option<Vec<String>>,
    news: Option<Vec<String>>,
    intro: Option<Vec<RawIntro>>,
    music: Option<Vec<RawMusic>>,
}

struct PreIntro {
    path: PathBuf,
    title: String,
    artist: String,
    album: Option<String>,
}

/// Load and merge one or more station definition files (each may in turn
/// `include` others) into a single resolved [`Definitions`].
pub fn load(files: &[PathBuf], extension: &str) -> Result<Definitions, ConfigError> {
    let mut defs = Definitions::default();
    let mut flat_intros: Vec<PreIntro> = Vec::new();
    let mut seen = HashSet::new();

    for file in files {
        load_one(file, extension, &mut defs, &mut flat_intros, &mut seen)?;
    }

    bind_intros(&mut defs, flat_intros, files.first())?;
    Ok(defs)
}

fn load_one(
    path: &Path,
    extension: &str,
    defs: &mut Definitions,
    flat_intros: &mut Vec<PreIntro>,
    in_progress: &mut HashSet<PathBuf>,
) -> Result<(), ConfigError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !in_progress.insert(canonical.clone()) {
        return Err(ConfigError::IncludeCycle(path.to_path_buf()));
    }

    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        file: path.to_path_buf(),
        source,
    })?;

    let value: serde_yaml::Value =
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            file: path.to_path_buf(),
            source,
        })?;

    check_known_keys(&value, DEF_KEYS, path)?;

    let raw: RawFile = serde_yaml::from_value(value).map_err(|source| ConfigError::Yaml {
        file: path.to_path_buf(),
        source,
    })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = match &raw.prefix {
        Some(prefix) => base_dir.join(prefix),
        None => base_dir.to_path_buf(),
    };

    if let Some(includes) = &raw.include {
        for inc in includes {
            let inc_path = base_dir.join(inc);
            load_one(&inc_path, extension, defs, flat_intros, in_progress)?;
        }
    }

    if raw.name.is_some() {
        defs.name = raw.name;
    }

    let locate = |stem: &str| locate_file(&base, stem, extension);

    defs.id.extend(raw.id.iter().flatten().map(|s| locate(s)));
    defs.solo.extend(raw.solo.iter().flatten().map(|s| locate(s)));
    defs.to_ad.extend(raw.to_ad.iter().flatten().map(|s| locate(s)));
    defs.to_news.extend(raw.to_news.iter().flatten().map(|s| locate(s)));
    defs.time_morning
        .extend(raw.time_morning.iter().flatten().map(|s| locate(s)));
    defs.time_evening
        .extend(raw.time_evening.iter().flatten().map(|s| locate(s)));
    defs.general.extend(raw.general.iter().flatten().map(|s| locate(s)));
    defs.ad.extend(raw.ad.iter().flatten().map(|s| locate(s)));
    defs.news.extend(raw.news.iter().flatten().map(|s| locate(s)));

    for m in raw.music.into_iter().flatten() {
        for field in MUSIC_REQUIRED_KEYS {
            let present = match *field {
                "path" => !m.path.is_empty(),
                "title" => !m.title.is_empty(),
                "artist" => !m.artist.is_empty(),
                "pre" => !m.pre.is_empty(),
                "post" => !m.post.is_empty(),
                _ => true,
            };
            if !present {
                return Err(ConfigError::MissingMusicField {
                    field: field.to_string(),
                    file: path.to_path_buf(),
                });
            }
        }

        let pre = parse_timestamp(&m.pre, path)?;
        let post = parse_timestamp(&m.post, path)?;
        let intro = match &m.intro {
            Some(stem) if !stem.is_empty() => vec![locate(stem)],
            _ => Vec::new(),
        };

        defs.music.push(MusicEntry {
            path: locate(&m.path),
            title: m.title,
            artist: m.artist,
            album: m.album,
            pre,
            post,
            intro,
        });
    }

    for intro in raw.intro.into_iter().flatten() {
        for field in INTRO_REQUIRED_KEYS {
            let present = match *field {
                "path" => !intro.path.is_empty(),
                "title" => !intro.title.is_empty(),
                "artist" => !intro.artist.is_empty(),
                _ => true,
            };
            if !present {
                return Err(ConfigError::MissingMusicField {
                    field: field.to_string(),
                    file: path.to_path_buf(),
                });
            }
        }
        flat_intros.push(PreIntro {
            path: locate(&intro.path),
            title: intro.title,
            artist: intro.artist,
            album: intro.album,
        });
    }

    in_progress.remove(&canonical);
    Ok(())
}

/// Bind each flat `intro` pool entry to exactly the `music` entry sharing
/// its (title, artist, album); fatal if zero or more than one match.
fn bind_intros(
    defs: &mut Definitions,
    flat_intros: Vec<PreIntro>,
    file_for_errors: Option<&PathBuf>,
) -> Result<(), ConfigError> {
    let file = file_for_errors.cloned().unwrap_or_default();
    for intro in flat_intros {
        let matches: Vec<usize> = defs
            .music
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.title == intro.title && m.artist == intro.artist && m.album == intro.album
            })
            .map(|(i, _)| i)
            .collect();

        match matches.as_slice() {
            [i] => defs.music[*i].intro.push(intro.path),
            _ => {
                return Err(ConfigError::UnmatchedIntro {
                    path: intro.path.display().to_string(),
                    file,
                })
            }
        }
    }
    Ok(())
}

fn locate_file(base: &Path, stem: &str, extension: &str) -> PathBuf {
    base.join(format!("{stem}.{extension}"))
}

fn parse_timestamp(value: &str, file: &Path) -> Result<f64, ConfigError> {
    let (minutes, seconds) = value.split_once(':').ok_or_else(|| ConfigError::BadTimestamp {
        value: value.to_string(),
        file: file.to_path_buf(),
    })?;
    let minutes: f64 = minutes.parse().map_err(|_| ConfigError::BadTimestamp {
        value: value.to_string(),
        file: file.to_path_buf(),
    })?;
    let seconds: f64 = seconds.parse().map_err(|_| ConfigError::BadTimestamp {
        value: value.to_string(),
        file: file.to_path_buf(),
    })?;
    Ok(minutes * 60.0 + seconds)
}

fn check_known_keys(value: &serde_yaml::Value, keys: &[&str], file: &Path) -> Result<(), ConfigError> {
    let mapping = match value.as_mapping() {
        Some(m) => m,
        None => return Ok(()),
    };
    for key in mapping.keys() {
        let key = match key.as_str() {
            Some(k) => k,
            None => continue,
        };
        if !keys.contains(&key) {
            return Err(ConfigError::UnknownKey {
                key: key.to_string(),
                file: file.to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Verify every file a [`Definitions`] references actually exists, printing
/// `NOT FOUND: <path>` per miss. Returns `true` iff everything was found.
pub fn lint(defs: &Definitions) -> bool {
    let mut ok = true;
    for path in defs.all_paths() {
        if !path.is_file() {
            println!("NOT FOUND: {}", path.display());
            ok = false;
        }
    }
    if ok {
        println!("ok!");
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes_and_seconds() {
        assert!((parse_timestamp("1:02.5", Path::new("x")).unwrap() - 62.5).abs() < 1e-9);
        assert!((parse_timestamp("0:00", Path::new("x")).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn bad_timestamp_is_an_error() {
        assert!(parse_timestamp("nope", Path::new("x")).is_err());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let value: serde_yaml::Value = serde_yaml::from_str("frobnicate: true\n").unwrap();
        let result = check_known_keys(&value, DEF_KEYS, Path::new("x.yaml"));
        assert!(matches!(result, Err(ConfigError::UnknownKey { .. })));
    }

    #[test]
    fn unmatched_flat_intro_is_fatal() {
        let mut defs = Definitions::default();
        let intros = vec![PreIntro {
            path: PathBuf::from("intro.ogg"),
            title: "Nonexistent Song".into(),
            artist: "Nobody".into(),
            album: None,
        }];
        let result = bind_intros(&mut defs, intros, Some(&PathBuf::from("x.yaml")));
        assert!(matches!(result, Err(ConfigError::UnmatchedIntro { .. })));
    }

    #[test]
    fn ambiguous_flat_intro_is_fatal() {
        let mut defs = Definitions::default();
        for _ in 0..2 {
            defs.music.push(MusicEntry {
                path: PathBuf::from("song.ogg"),
                title: "Same Title".into(),
                artist: "Same Artist".into(),
                album: None,
                pre: 0.0,
                post: 0.0,
                intro: Vec::new(),
            });
        }
        let intros = vec![PreIntro {
            path: PathBuf::from("intro.ogg"),
            title: "Same Title".into(),
            artist: "Same Artist".into(),
            album: None,
        }];
        let result = bind_intros(&mut defs, intros, Some(&PathBuf::from("x.yaml")));
        assert!(matches!(result, Err(ConfigError::UnmatchedIntro { .. })));
    }
}
