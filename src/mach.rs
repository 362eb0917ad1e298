//! Raw Mach/Mach-O bindings and helpers this crate is built on.
//!
//! Just exports the mach2 functions we use into a flat list and adds the
//! handful of Mach-O structures `mach2` doesn't carry (load commands).

pub use mach2::{
    kern_return::{kern_return_t, KERN_SUCCESS},
    mach_types::task_t,
    message::mach_msg_type_number_t,
    task::task_info,
    task_info::{task_dyld_info, TASK_DYLD_INFO},
    traps::mach_task_self,
    vm::{
        mach_vm_allocate, mach_vm_deallocate, mach_vm_protect, mach_vm_read_overwrite,
        mach_vm_region_recurse, mach_vm_write,
    },
    vm_inherit::vm_inherit_t,
    vm_prot::vm_prot_t,
    vm_region::vm_region_submap_info_64,
    vm_types::{mach_vm_address_t, mach_vm_size_t},
};

/// `task_dyld_info`'s required info count, i.e. its size in `u32` words.
pub const TASK_DYLD_INFO_COUNT: mach_msg_type_number_t =
    (std::mem::size_of::<task_dyld_info>() / std::mem::size_of::<u32>()) as mach_msg_type_number_t;

/// A Mach kernel error.
///
/// See <usr/include/mach/kern_return.h>.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("specified address is not currently valid")]
    InvalidAddress = 1,
    #[error("specified memory is valid, but does not permit the required forms of access")]
    ProtectionFailure = 2,
    #[error("the address range specified is already in use, or no address range of the size specified could be found")]
    NoSpace = 3,
    #[error("the function requested was not applicable to this type of argument, or an argument is invalid")]
    InvalidArgument = 4,
    #[error("the function could not be performed")]
    Failure = 5,
    #[error("system resource could not be allocated to fulfill this request")]
    ResourceShortage = 6,
    #[error("the task in question does not hold receive rights for the port argument")]
    NotReceiver = 7,
    #[error("bogus access restriction")]
    NoAccess = 8,
    #[error(
        "during a page fault, the target address refers to a memory object that has been destroyed"
    )]
    MemoryFailure = 9,
    #[error(
        "during a page fault, the memory object indicated that the data could not be returned"
    )]
    MemoryError = 10,
    #[error("a blatant range error")]
    InvalidValue = 18,
    #[error("the name doesn't denote a right in the task")]
    InvalidName = 15,
    #[error("target task isn't an active task")]
    InvalidTask = 16,
    #[error("the name denotes a right, but not an appropriate right")]
    InvalidRight = 17,
    #[error("a search or query operation did not return a result")]
    NotFound = 56,
    #[error("mach kernel error {0}")]
    Other(kern_return_t),
}

impl From<kern_return_t> for KernelError {
    fn from(kr: kern_return_t) -> Self {
        use mach2::kern_return::*;

        match kr {
            KERN_INVALID_ADDRESS => Self::InvalidAddress,
            KERN_PROTECTION_FAILURE => Self::ProtectionFailure,
            KERN_NO_SPACE => Self::NoSpace,
            KERN_INVALID_ARGUMENT => Self::InvalidArgument,
            KERN_FAILURE => Self::Failure,
            KERN_RESOURCE_SHORTAGE => Self::ResourceShortage,
            KERN_NOT_RECEIVER => Self::NotReceiver,
            KERN_NO_ACCESS => Self::NoAccess,
            KERN_MEMORY_FAILURE => Self::MemoryFailure,
            KERN_MEMORY_ERROR => Self::MemoryError,
            KERN_INVALID_VALUE => Self::InvalidValue,
            KERN_INVALID_NAME => Self::InvalidName,
            KERN_INVALID_TASK => Self::InvalidTask,
            KERN_INVALID_RIGHT => Self::InvalidRight,
            56 => Self::NotFound,
            other => Self::Other(other),
        }
    }
}

/// Runs a mach call and turns a non-`KERN_SUCCESS` return into a
/// [`KernelError`]. Mirrors the `mach_call!` shape used elsewhere in the
/// ecosystem, just as a plain function rather than a macro since we
/// don't need the call-site string for diagnostics here.
#[inline]
pub fn kern_ret(kr: kern_return_t) -> Result<(), KernelError> {
    if kr == KERN_SUCCESS {
        Ok(())
    } else {
        Err(KernelError::from(kr))
    }
}

/// Rounds `[addr, addr+size)` out to whole pages, per the protection-flip
/// discipline described in the spec (§5): callers that need to mutate
/// code in place must operate on the containing page window.
pub fn page_align_range(addr: u64, size: u64, page_size: u64) -> std::ops::Range<u64> {
    let page_start = addr & !(page_size - 1);
    let page_end = (addr + size + page_size - 1) & !(page_size - 1);
    page_start..page_end
}

/// `addr`'s containing page base, i.e. `addr & ~(page_size - 1)`.
#[inline]
pub fn page_base(addr: u64, page_size: u64) -> u64 {
    addr & !(page_size - 1)
}

// usr/include/mach-o/loader.h, magic number for a 64-bit MachHeader
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
// usr/include/mach-o/loader.h, command to map a segment
pub const LC_SEGMENT_64: u32 = 0x19;
// usr/include/mach-o/loader.h, dynamically linked shared lib ident
pub const LC_ID_DYLIB: u32 = 0xd;
// usr/include/mach-o/loader.h, the uuid
pub const LC_UUID: u32 = 0x1b;

// usr/include/mach-o/loader.h
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MachHeader {
    pub magic: u32,         // mach magic number identifier
    pub cpu_type: i32,      // cpu_type_t cpu specifier
    pub cpu_sub_type: i32,  // cpu_subtype_t machine specifier
    pub file_type: u32,     // type of file
    pub num_commands: u32,  // number of load commands
    pub size_commands: u32, // size of all the load commands
    pub flags: u32,
    __reserved: u32,
}

// usr/include/mach-o/loader.h
#[repr(C)]
pub struct LoadCommandBase {
    pub cmd: u32,      // type of load command
    pub cmd_size: u32, // total size of the command in bytes
}

/*
 * The 64-bit segment load command indicates that a part of this file is to
 * be mapped into a 64-bit task's address space.
 */
#[repr(C)]
pub struct SegmentCommand64 {
    cmd: u32,                   // type of load command
    cmd_size: u32,              // total size of the command in bytes
    pub segment_name: [u8; 16], // string name of the section
    pub vm_addr: u64,           // memory address the segment is mapped to
    pub vm_size: u64,           // total size of the segment
    pub file_off: u64,          // file offset of the segment
    pub file_size: u64,         // amount mapped from the file
    pub max_prot: i32,          // maximum VM protection
    pub init_prot: i32,         // initial VM protection
    pub num_sections: u32,      // number of sections in the segment
    pub flags: u32,
}

#[repr(C)]
pub struct Dylib {
    pub name: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

#[repr(C)]
pub struct DylibCommand {
    cmd: u32,
    cmd_size: u32,
    pub dylib: Dylib,
}

/// The uuid load command contains a single 128-bit unique random number
/// that identifies an object produced by the static link editor.
#[repr(C)]
pub struct UuidCommand {
    cmd: u32,
    cmd_size: u32,
    pub uuid: [u8; 16],
}

/// A block of load commands for a particular image, read as a flat byte
/// buffer since commands vary in size and can't be indexed as a slice.
pub struct LoadCommands {
    pub buffer: Vec<u8>,
    pub count: u32,
}

impl LoadCommands {
    #[inline]
    pub fn iter(&self) -> LoadCommandsIter<'_> {
        LoadCommandsIter {
            buffer: &self.buffer,
            count: self.count,
        }
    }
}

pub enum LoadCommand<'buf> {
    Segment(&'buf SegmentCommand64),
    Dylib(&'buf DylibCommand),
    Uuid(&'buf UuidCommand),
}

pub struct LoadCommandsIter<'buf> {
    buffer: &'buf [u8],
    count: u32,
}

impl<'buf> Iterator for LoadCommandsIter<'buf> {
    type Item = LoadCommand<'buf>;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: we're interpreting raw bytes as C structs, guarded by
        // the cmd_size/buffer-length check below on each step.
        unsafe {
            loop {
                if self.count == 0 || self.buffer.len() < std::mem::size_of::<LoadCommandBase>() {
                    return None;
                }

                let header = &*(self.buffer.as_ptr().cast::<LoadCommandBase>());

                if header.cmd_size as usize > self.buffer.len() {
                    return None;
                }

                let cmd = match header.cmd {
                    LC_SEGMENT_64 => Some(LoadCommand::Segment(
                        &*(self.buffer.as_ptr().cast::<SegmentCommand64>()),
                    )),
                    LC_ID_DYLIB => Some(LoadCommand::Dylib(
                        &*(self.buffer.as_ptr().cast::<DylibCommand>()),
                    )),
                    LC_UUID => Some(LoadCommand::Uuid(
                        &*(self.buffer.as_ptr().cast::<UuidCommand>()),
                    )),
                    _ => None,
                };

                self.count -= 1;
                self.buffer = &self.buffer[header.cmd_size as usize..];

                if let Some(cmd) = cmd {
                    return Some(cmd);
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let sz = self.count as usize;
        (sz, Some(sz))
    }
}
