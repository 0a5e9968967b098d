//! Parsers for host tool output.
//!
//! `hdiutil attach` and `hdiutil info` both print tab-separated device
//! lines of the form `{device}\t{content hint}\t{mount point}`; `info`
//! groups them in blocks headed by `image-path : {container}`.

use std::path::{Path, PathBuf};

/// One `/dev/...` line from hdiutil output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Device node (e.g. `/dev/disk5s1`)
    pub device: String,
    /// Mount point, for the partition that carries the filesystem
    pub mount_point: Option<PathBuf>,
}

/// An attached container as reported by `hdiutil info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedImage {
    /// Container path the image was attached from
    pub image_path: PathBuf,
    /// Device lines belonging to this image
    pub devices: Vec<DeviceEntry>,
}

impl AttachedImage {
    /// First mounted filesystem of this image.
    pub fn mount_point(&self) -> Option<&Path> {
        self.devices.iter().find_map(|d| d.mount_point.as_deref())
    }

    /// Whole-disk device node (the first device line).
    pub fn whole_disk(&self) -> Option<&str> {
        self.devices.first().map(|d| d.device.as_str())
    }
}

const BLOCK_SEPARATOR: &str = "================================================";

/// Parse a single device line.
///
/// Returns `None` for lines that are not device lines.
pub fn parse_device_line(line: &str) -> Option<DeviceEntry> {
    let mut fields = line.split('\t');
    let device = fields.next()?.trim();
    if !device.starts_with("/dev/") {
        return None;
    }

    // Mount points may contain spaces, so only surrounding whitespace is trimmed
    let mount_point = fields
        .nth(1)
        .map(str::trim)
        .filter(|mp| !mp.is_empty())
        .map(PathBuf::from);

    Some(DeviceEntry {
        device: device.to_owned(),
        mount_point,
    })
}

/// Extract the mount point from `hdiutil attach` output.
pub fn parse_attach_output(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .filter_map(parse_device_line)
        .find_map(|entry| entry.mount_point)
}

/// Parse `hdiutil info` into attached images.
pub fn parse_info_output(output: &str) -> Vec<AttachedImage> {
    let mut images = Vec::new();

    for block in output.split(BLOCK_SEPARATOR) {
        let mut image_path = None;
        let mut devices = Vec::new();

        for line in block.lines() {
            if let Some(entry) = parse_device_line(line) {
                devices.push(entry);
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                if key.trim() == "image-path" {
                    image_path = Some(PathBuf::from(value.trim()));
                }
            }
        }

        if let Some(image_path) = image_path {
            images.push(AttachedImage {
                image_path,
                devices,
            });
        }
    }

    images
}

/// Mount point column of `df -P {path}` output.
pub fn parse_df_mount_point(output: &str) -> Option<PathBuf> {
    // Header, then: {filesystem} {blocks} {used} {avail} {capacity} {mounted on...}
    let line = output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    Some(PathBuf::from(fields[5..].join(" ")))
}

/// `Volume UUID:` value from `diskutil info` output.
pub fn parse_volume_uuid(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "Volume UUID")
            .then(|| value.trim().to_owned())
            .filter(|v| !v.is_empty())
    })
}
