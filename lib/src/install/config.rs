//! # Build configuration
//!
//! Optional TOML fragments stored in `makedistro/` below the conventional
//! systemd configuration directories (e.g. `/etc/makedistro/05-local.toml`).

use std::path::Path;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use crate::distro::DistroSettings;

const DEFAULT_LOCALE: &str = "en_US.UTF-8";

/// Images smaller than this cannot hold the ESP and a usable root.
const MIN_IMAGE_SIZE_MIB: u64 = 1024;

/// The toplevel of a configuration fragment.
#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct ConfigurationToplevel {
    pub(crate) build: Option<BuildConfiguration>,
}

/// The serialized `[build]` section
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename = "build", rename_all = "kebab-case")]
pub(crate) struct BuildConfiguration {
    /// Target architecture; selects the root partition type
    pub(crate) arch: Option<String>,
    /// Size of newly created image files
    pub(crate) image_size_mib: Option<u64>,
    pub(crate) locale: Option<String>,
    /// Distribution release, for the plugins that have one
    pub(crate) release: Option<String>,
}

impl BuildConfiguration {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
            if let Some(o) = o {
                *s = Some(o);
            }
        }
        mergeopt(&mut self.arch, other.arch);
        mergeopt(&mut self.image_size_mib, other.image_size_mib);
        mergeopt(&mut self.locale, other.locale);
        mergeopt(&mut self.release, other.release);
    }
}

/// Parse one fragment, warning about keys we don't know.
fn parse_fragment(buf: &str, path: &Path) -> Result<Option<BuildConfiguration>> {
    let mut unused = std::collections::BTreeSet::new();
    let de = toml::Deserializer::new(buf);
    let c: ConfigurationToplevel = serde_ignored::deserialize(de, |key| {
        unused.insert(key.to_string());
    })
    .with_context(|| format!("Parsing {path:?}"))?;
    for key in unused {
        eprintln!("warning: {path:?}: Unknown key {key}");
    }
    Ok(c.build)
}

fn merge_fragments<'a>(
    fragments: impl IntoIterator<Item = (&'a Path, String)>,
) -> Result<BuildConfiguration> {
    let mut config = BuildConfiguration::default();
    for (path, buf) in fragments {
        if let Some(build) = parse_fragment(&buf, path)? {
            tracing::debug!("Merging build config from {path:?}: {build:?}");
            config.merge(build);
        }
    }
    Ok(config)
}

#[context("Loading configuration")]
/// Load the build configuration, merging all found configuration files and
/// finally `extra`, if given.
pub(crate) fn load_config(extra: Option<&Utf8Path>) -> Result<BuildConfiguration> {
    const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];
    let fragments = liboverdrop::scan(SYSTEMD_CONVENTIONAL_BASES, "makedistro", &["toml"], true);
    let mut paths: Vec<_> = fragments.into_values().collect();
    if let Some(extra) = extra {
        paths.push(extra.as_std_path().to_owned());
    }
    let mut bufs = Vec::with_capacity(paths.len());
    for path in &paths {
        let buf = std::fs::read_to_string(path).with_context(|| format!("Reading {path:?}"))?;
        bufs.push((path.as_path(), buf));
    }
    merge_fragments(bufs)
}

/// Settings for one build, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BuildConfig {
    pub(crate) arch: String,
    pub(crate) image_size_mib: u64,
    pub(crate) locale: String,
    pub(crate) release: Option<String>,
}

impl BuildConfig {
    /// Fill in defaults for whatever `config` leaves out. `arch` takes
    /// precedence over the configured architecture.
    pub(crate) fn new(config: BuildConfiguration, arch: Option<String>) -> Result<Self> {
        let image_size_mib = config
            .image_size_mib
            .unwrap_or(makedistro_blockdev::DEFAULT_IMAGE_SIZE_MIB);
        if image_size_mib < MIN_IMAGE_SIZE_MIB {
            anyhow::bail!(
                "image-size-mib must be at least {MIN_IMAGE_SIZE_MIB}, not {image_size_mib}"
            );
        }
        Ok(Self {
            arch: arch
                .or(config.arch)
                .unwrap_or_else(|| std::env::consts::ARCH.to_owned()),
            image_size_mib,
            locale: config.locale.unwrap_or_else(|| DEFAULT_LOCALE.to_owned()),
            release: config.release,
        })
    }

    pub(crate) fn distro_settings(&self) -> DistroSettings {
        DistroSettings {
            locale: self.locale.clone(),
            release: self.release.clone(),
        }
    }
}
