//! Cloud-image catalogue, download cache and per-instance working disks.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::error::QvmError;
use crate::paths::Layout;
use crate::settings::ImageVersions;

pub const DEFAULT_DISK_SIZE: &str = "16G";

/// Produces the working disk for a new instance.
#[allow(async_fn_in_trait)]
pub trait ImageSource {
    /// Materialize `vms/<id>-0.<ext>` from the `os`/`version` base image,
    /// grown to `size`, and return its path.
    async fn prepare_disk(
        &self,
        os: &str,
        version: &str,
        id: u32,
        size: &str,
    ) -> Result<PathBuf, QvmError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub url: String,
    pub filename: String,
}

impl ImageEntry {
    /// Extension of the cached file, carried over to the working disk.
    pub fn extension(&self) -> &str {
        Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("img")
    }
}

/// Debian/Ubuntu publish under Debian architecture names, the RHEL family
/// under kernel names.
fn arch_names(arch: &str) -> Option<(&'static str, &'static str)> {
    match arch {
        "x86_64" | "amd64" => Some(("amd64", "x86_64")),
        "aarch64" | "arm64" => Some(("arm64", "aarch64")),
        _ => None,
    }
}

/// Download location for an OS/version on `arch`.
pub fn catalogue_entry(
    os: &str,
    version: &str,
    arch: &str,
    versions: &ImageVersions,
) -> Result<ImageEntry, QvmError> {
    let os = os.to_ascii_lowercase();
    let allowed = versions
        .for_os(&os)
        .ok_or_else(|| QvmError::UnsupportedOs { os: os.clone() })?;
    if !allowed.iter().any(|v| v == version) {
        return Err(QvmError::UnsupportedVersion {
            os,
            version: version.into(),
        });
    }
    let (deb_arch, rpm_arch) = arch_names(arch).ok_or_else(|| QvmError::Validation {
        message: format!("no cloud images published for architecture {arch}"),
    })?;

    let (url, filename) = match os.as_str() {
        "debian" => {
            let codename = match version {
                "11" => "bullseye",
                "12" => "bookworm",
                "13" => "trixie",
                _ => {
                    return Err(QvmError::UnsupportedVersion {
                        os,
                        version: version.into(),
                    });
                }
            };
            let file = format!("debian-{version}-generic-{deb_arch}.qcow2");
            (
                format!("https://cloud.debian.org/images/cloud/{codename}/latest/{file}"),
                file,
            )
        }
        "ubuntu" => {
            let file = format!("ubuntu-{version}-server-cloudimg-{deb_arch}.img");
            (
                format!("https://cloud-images.ubuntu.com/releases/{version}/release/{file}"),
                file,
            )
        }
        "centos" => {
            let file = format!("CentOS-Stream-GenericCloud-{version}-latest.{rpm_arch}.qcow2");
            (
                format!("https://cloud.centos.org/centos/{version}-stream/{rpm_arch}/images/{file}"),
                file,
            )
        }
        "rockylinux" => {
            let file = format!("Rocky-{version}-GenericCloud-Base.latest.{rpm_arch}.qcow2");
            (
                format!("https://dl.rockylinux.org/pub/rocky/{version}/images/{rpm_arch}/{file}"),
                file,
            )
        }
        "almalinux" => {
            let file = format!("AlmaLinux-{version}-GenericCloud-latest.{rpm_arch}.qcow2");
            (
                format!("https://repo.almalinux.org/almalinux/{version}/cloud/{rpm_arch}/images/{file}"),
                file,
            )
        }
        _ => return Err(QvmError::UnsupportedOs { os }),
    };
    Ok(ImageEntry { url, filename })
}

/// Downloads base images into `images/` once, then copies and resizes a
/// private disk per instance.
#[derive(Debug, Clone)]
pub struct ImageCache {
    layout: Layout,
    versions: ImageVersions,
}

impl ImageCache {
    pub fn new(layout: Layout, versions: ImageVersions) -> Self {
        Self { layout, versions }
    }

    /// Local copy of `entry`, downloading it first if needed.
    pub async fn ensure_base_image(&self, entry: &ImageEntry) -> Result<PathBuf, QvmError> {
        let cache_dir = self.layout.images_dir();
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| QvmError::Io {
                context: format!("creating cache dir {}", cache_dir.display()),
                source: e,
            })?;

        let dest = cache_dir.join(&entry.filename);
        if dest.exists() {
            tracing::info!(path = %dest.display(), "using cached base image");
            return Ok(dest);
        }

        tracing::info!(url = %entry.url, "downloading base image");
        let response = reqwest::get(&entry.url)
            .await
            .map_err(|e| QvmError::ImageDownload {
                message: format!("request to {} failed", entry.url),
                source: Box::new(e),
            })?;
        if !response.status().is_success() {
            return Err(QvmError::ImageDownload {
                message: format!("HTTP {} from {}", response.status(), entry.url),
                source: format!("HTTP {}", response.status()).into(),
            });
        }

        let pb = ProgressBar::new(response.content_length().unwrap_or(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .expect("valid progress template")
                .progress_chars("#>-"),
        );

        let part = cache_dir.join(format!("{}.part", entry.filename));
        let _ = tokio::fs::remove_file(&part).await;
        if let Err(e) = download_to_file(&part, response, &pb).await {
            pb.abandon();
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
        tokio::fs::rename(&part, &dest)
            .await
            .map_err(|e| QvmError::Io {
                context: format!("renaming {} to {}", part.display(), dest.display()),
                source: e,
            })?;
        pb.finish_and_clear();

        tracing::info!(path = %dest.display(), "base image cached");
        Ok(dest)
    }
}

impl ImageSource for ImageCache {
    async fn prepare_disk(
        &self,
        os: &str,
        version: &str,
        id: u32,
        size: &str,
    ) -> Result<PathBuf, QvmError> {
        let entry = catalogue_entry(os, version, std::env::consts::ARCH, &self.versions)?;
        let base = self.ensure_base_image(&entry).await?;

        let disk = self.layout.disk_file(id, entry.extension());
        tracing::info!(id, from = %base.display(), to = %disk.display(), "copying base image");
        tokio::fs::copy(&base, &disk)
            .await
            .map_err(|e| QvmError::Io {
                context: format!("copying {} to {}", base.display(), disk.display()),
                source: e,
            })?;

        let size = if size.is_empty() { DEFAULT_DISK_SIZE } else { size };
        resize(&disk, size).await?;
        Ok(disk)
    }
}

async fn resize(disk: &Path, size: &str) -> Result<(), QvmError> {
    tracing::info!(path = %disk.display(), size, "resizing disk");
    let output = tokio::process::Command::new("qemu-img")
        .arg("resize")
        .arg(disk)
        .arg(size)
        .output()
        .await
        .map_err(|e| QvmError::ExternalCommand {
            command: "qemu-img resize".into(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(QvmError::ExternalCommand {
            command: "qemu-img resize".into(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), QvmError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| QvmError::Io {
            context: format!("creating {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| QvmError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| QvmError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| QvmError::Io {
        context: format!("flushing {}", path.display()),
        source: e,
    })
}
