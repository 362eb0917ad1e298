//! Image/Segment Locator: enumerates a task's loaded Mach-O images and
//! resolves a named segment within one of them (spec §4.3).
//!
//! Walking a task's dyld image list (rather than the calling process's
//! own `_dyld_get_image_*` table, which only covers the self task) is
//! grounded on the task-dyld-info + `dyld_all_image_infos` read path
//! used elsewhere in the ecosystem's task-introspection tooling.

use crate::engine::Engine;
use crate::error::{EngineError, ErrorKind};
use crate::mach::{
    task_info, task_dyld_info, LoadCommand, LoadCommands, MachHeader, SegmentCommand64,
    TASK_DYLD_INFO, TASK_DYLD_INFO_COUNT, LC_SEGMENT_64, MH_MAGIC_64,
};

/// One loaded image's load address, dyld-reported file path, and ASLR
/// slide (the difference between its runtime load address and its
/// link-time `__TEXT` address).
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub load_address: u64,
    pub file_path: String,
    pub slide: i64,
}

/// A resolved `LC_SEGMENT_64`'s virtual address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    pub segment_start: u64,
    pub segment_end: u64,
}

impl SegmentRange {
    pub fn len(&self) -> u64 {
        self.segment_end - self.segment_start
    }

    pub fn is_empty(&self) -> bool {
        self.segment_start == self.segment_end
    }
}

// dyld_image_info, usr/include/mach-o/dyld_images.h
#[repr(C)]
struct DyldImageInfo {
    load_address: u64,
    file_path: u64,
    file_mod_date: u64,
}

// dyld_all_image_infos, usr/include/mach-o/dyld_images.h. We only read
// the handful of leading fields we need.
#[repr(C)]
struct DyldAllImageInfos {
    version: u32,
    info_array_count: u32,
    info_array_addr: u64,
}

/// Locates images and segments within a task by reading its dyld image
/// list through the task port, rather than assuming the locating
/// process and the target task are the same.
pub struct Locator<'a> {
    engine: &'a Engine,
}

impl<'a> Locator<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    fn all_image_info_addr(&self) -> Result<u64, EngineError> {
        let mut info = task_dyld_info::default();
        let mut count = TASK_DYLD_INFO_COUNT;

        // SAFETY: `info` is sized for TASK_DYLD_INFO_COUNT and only read
        // back after a successful call.
        let kr = unsafe {
            task_info(
                self.engine.task(),
                TASK_DYLD_INFO,
                (&mut info as *mut task_dyld_info).cast(),
                &mut count,
            )
        };

        crate::mach::kern_ret(kr)
            .map(|_| info.all_image_info_addr)
            .map_err(|kernel| {
                EngineError::kernel(
                    ErrorKind::BinaryNotFound,
                    "failed to read task_dyld_info",
                    kernel,
                )
            })
    }

    /// Lists every image currently loaded in the task.
    pub fn list_images(&self) -> Result<Vec<ImageDescriptor>, EngineError> {
        let all_images_addr = self.all_image_info_addr()?;

        let header_buf = self
            .engine
            .read_raw(all_images_addr, std::mem::size_of::<DyldAllImageInfos>())
            .ok_or_else(|| {
                EngineError::new(ErrorKind::BinaryNotFound, "failed to read dyld_all_image_infos")
            })?;

        // SAFETY: header_buf is exactly sized for DyldAllImageInfos and
        // was populated by a successful read above.
        let all_info: &DyldAllImageInfos = unsafe { &*(header_buf.as_ptr().cast()) };

        let entries_len =
            all_info.info_array_count as usize * std::mem::size_of::<DyldImageInfo>();
        let entries_buf = self
            .engine
            .read_raw(all_info.info_array_addr, entries_len)
            .ok_or_else(|| {
                EngineError::new(ErrorKind::BinaryNotFound, "failed to read dyld image array")
            })?;

        // SAFETY: entries_buf is sized for info_array_count DyldImageInfo
        // entries.
        let entries: &[DyldImageInfo] = unsafe {
            std::slice::from_raw_parts(
                entries_buf.as_ptr().cast(),
                all_info.info_array_count as usize,
            )
        };

        let mut images = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = self.read_c_string(entry.file_path).unwrap_or_default();
            let slide = self.compute_slide(entry.load_address).unwrap_or(0);
            images.push(ImageDescriptor {
                load_address: entry.load_address,
                file_path: path,
                slide,
            });
        }

        Ok(images)
    }

    /// Derives an image's ASLR slide from its first segment with
    /// `file_off == 0 && file_size != 0` (normally `__TEXT`):
    /// `slide = load_address - segment.vm_addr`, the same relation the
    /// source's module list builder uses. Returns `0` for an image whose
    /// header or load commands can't be read, rather than failing the
    /// whole listing over one unreadable image.
    fn compute_slide(&self, load_address: u64) -> Option<i64> {
        let (_header, commands) = self.read_header_and_commands(load_address).ok()?;

        for command in commands.iter() {
            if let LoadCommand::Segment(seg) = command {
                if seg.file_off == 0 && seg.file_size != 0 {
                    return Some(load_address as i64 - seg.vm_addr as i64);
                }
            }
        }

        Some(0)
    }

    /// Reads and validates a Mach-O header at `load_address`, then reads
    /// the load commands that follow it.
    fn read_header_and_commands(
        &self,
        load_address: u64,
    ) -> Result<(MachHeader, LoadCommands), EngineError> {
        let header_buf = self
            .engine
            .read_raw(load_address, std::mem::size_of::<MachHeader>())
            .ok_or_else(|| {
                EngineError::new(ErrorKind::BinaryNotFound, "failed to read Mach-O header")
            })?;

        // SAFETY: header_buf is exactly sized for MachHeader.
        let header: MachHeader = unsafe { *(header_buf.as_ptr().cast()) };

        if header.magic != MH_MAGIC_64 {
            return Err(EngineError::new(
                ErrorKind::BinaryNotFound,
                "image does not start with a 64-bit Mach-O header",
            ));
        }

        let commands_addr = load_address + std::mem::size_of::<MachHeader>() as u64;
        let commands_buf = self
            .engine
            .read_raw(commands_addr, header.size_commands as usize)
            .ok_or_else(|| {
                EngineError::new(ErrorKind::SegmentNotFound, "failed to read load commands")
            })?;

        let commands = LoadCommands {
            buffer: commands_buf,
            count: header.num_commands,
        };

        Ok((header, commands))
    }

    fn read_c_string(&self, addr: u64) -> Option<String> {
        const MAX_PATH_LEN: usize = 4096;

        let buffer = self.engine.read_raw(addr, MAX_PATH_LEN)?;
        let end = buffer.iter().position(|&b| b == 0)?;
        String::from_utf8(buffer[..end].to_vec()).ok()
    }

    /// Locates the first image whose dyld-reported path contains
    /// `name_substring`.
    pub fn locate(&self, name_substring: &str) -> Result<ImageDescriptor, EngineError> {
        let images = self.list_images()?;

        images
            .into_iter()
            .find(|img| img.file_path.contains(name_substring))
            .ok_or_else(|| {
                EngineError::new(
                    ErrorKind::BinaryNotFound,
                    format!("no loaded image matching '{name_substring}'"),
                )
            })
    }

    /// Resolves a named `LC_SEGMENT_64` (e.g. `"__TEXT"`) within `image`,
    /// applying its ASLR slide to give the absolute `[vm_addr + slide,
    /// vm_addr + slide + vm_size)` range the segment actually occupies at
    /// runtime (spec §3/§4.3) -- `seg.vm_addr` alone is only the
    /// link-time address.
    pub fn resolve_segment(
        &self,
        image: &ImageDescriptor,
        segment_name: &str,
    ) -> Result<SegmentRange, EngineError> {
        let (_header, commands) = self.read_header_and_commands(image.load_address)?;

        for command in commands.iter() {
            if let LoadCommand::Segment(seg) = command {
                if segment_name_matches(&seg.segment_name, segment_name) {
                    let start = (seg.vm_addr as i64 + image.slide) as u64;
                    return Ok(SegmentRange {
                        segment_start: start,
                        segment_end: start + seg.vm_size,
                    });
                }
            }
        }

        Err(EngineError::new(
            ErrorKind::SegmentNotFound,
            format!("segment '{segment_name}' not found in image"),
        ))
    }
}

fn segment_name_matches(raw: &[u8; 16], name: &str) -> bool {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..end] == name.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_matching_stops_at_nul() {
        let mut raw = [0u8; 16];
        raw[..6].copy_from_slice(b"__TEXT");
        assert!(segment_name_matches(&raw, "__TEXT"));
        assert!(!segment_name_matches(&raw, "__DATA"));
    }

    #[test]
    fn locate_finds_self_by_executable_name() {
        let engine = Engine::current_task();
        let locator = Locator::new(&engine);

        let images = locator.list_images().expect("list images");
        assert!(!images.is_empty());
    }
}
