//! Flash image persisted to a regular file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace};

use super::{BlockDevice, FlashGeometry, ERASED};
use crate::error::{Error, Result};

/// A flash part whose contents live in a file on the host.
///
/// A missing image is created fully erased. Programs read-modify-write the
/// affected bytes so the file keeps NOR semantics.
#[derive(Debug)]
pub struct FileFlash {
    path: PathBuf,
    file: File,
    geometry: FlashGeometry,
}

impl FileFlash {
    /// Open the image at `path`, creating an erased one if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or opened, or if an
    /// existing image does not match the configured capacity.
    pub fn open(path: impl AsRef<Path>, geometry: FlashGeometry) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let fresh = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if fresh {
            let sector = vec![ERASED; geometry.sector_size as usize];
            for _ in 0..geometry.capacity / geometry.sector_size {
                file.write_all(&sector)?;
            }
            file.sync_all()?;
            info!(
                "Created erased {} byte flash image at {}",
                geometry.capacity,
                path.display()
            );
        } else {
            let len = file.metadata()?.len();
            if len != u64::from(geometry.capacity) {
                return Err(Error::ConfigValidation {
                    message: format!(
                        "flash image {} is {len} bytes but capacity_bytes is {}",
                        path.display(),
                        geometry.capacity
                    ),
                });
            }
            debug!("Opened flash image at {}", path.display());
        }

        Ok(Self {
            path,
            file,
            geometry,
        })
    }

    /// Path of the backing image.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.geometry.check_range(addr, buf.len())?;
        self.file.seek(SeekFrom::Start(u64::from(addr)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        self.geometry.check_erase(addr)?;
        trace!(addr = format_args!("{addr:#010x}"), "erase sector");
        self.file.seek(SeekFrom::Start(u64::from(addr)))?;
        self.file
            .write_all(&vec![ERASED; self.geometry.sector_size as usize])?;
        self.file.sync_data()?;
        Ok(())
    }

    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.geometry.check_program(addr, data.len())?;
        trace!(
            addr = format_args!("{addr:#010x}"),
            len = data.len(),
            "program page"
        );
        let mut cells = vec![0u8; data.len()];
        self.read(addr, &mut cells)?;
        for (cell, byte) in cells.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.file.seek(SeekFrom::Start(u64::from(addr)))?;
        self.file.write_all(&cells)?;
        self.file.sync_data()?;
        Ok(())
    }
}
