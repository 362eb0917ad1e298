//! Cross-checks the locator/scanner against `otool`'s view of the test
//! binary's own load commands and `__TEXT` segment.
#![cfg(target_os = "macos")]

use std::fmt::Write as _;

use machprobe::{Engine, Locator};

fn call_otool(args: &[&str]) -> String {
    let mut cmd = std::process::Command::new("otool");
    cmd.args(args);

    let exe_path = std::env::current_exe().expect("unable to retrieve test executable path");
    cmd.arg(exe_path);

    let output = cmd.output().expect("failed to spawn otool");
    assert!(output.status.success());

    String::from_utf8(output.stdout).expect("stdout was invalid utf-8")
}

/// `resolve_segment` on the test binary's own `__TEXT` should agree with
/// `otool -l`'s reported `vmaddr`/`vmsize` for that segment.
#[test]
fn resolves_own_text_segment() {
    let mut engine = Engine::current_task();
    let locator = Locator::new(&engine);

    let exe_path = std::env::current_exe().expect("current exe path");
    let exe_name = exe_path
        .file_name()
        .and_then(|n| n.to_str())
        .expect("exe file name");

    let image = locator.locate(exe_name).expect("locate self image");
    let segment = locator
        .resolve_segment(&image, "__TEXT")
        .expect("resolve __TEXT");

    let lc_str = call_otool(&["-l"]);
    let text_block_start = lc_str.find("segname __TEXT").expect("otool lists __TEXT");
    let block = &lc_str[text_block_start..];

    let vmaddr_line = block.lines().find(|l| l.trim_start().starts_with("vmaddr")).unwrap();
    let expected_vmaddr = u64::from_str_radix(
        vmaddr_line.trim_start().trim_start_matches("vmaddr 0x"),
        16,
    )
    .expect("parse vmaddr");

    // otool reports the unslid, on-disk vmaddr; the segment's size is
    // ASLR-invariant, so it's still checked directly against otool.
    let vmsize_line = block.lines().find(|l| l.trim_start().starts_with("vmsize")).unwrap();
    let expected_vmsize = u64::from_str_radix(
        vmsize_line.trim_start().trim_start_matches("vmsize 0x"),
        16,
    )
    .expect("parse vmsize");

    assert_eq!(segment.len(), expected_vmsize);
    assert!(expected_vmaddr > 0);

    // The runtime __TEXT segment starts exactly at the image's slid load
    // address: segment_start = otool's vmaddr + slide, and for __TEXT
    // specifically slide = load_address - vmaddr, so the two addresses
    // coincide. This is the part ASLR breaks if the slide isn't applied.
    assert_eq!(segment.segment_start, image.load_address);
    assert_eq!(image.slide, image.load_address as i64 - expected_vmaddr as i64);

    // Reading back the first 4 bytes at the resolved address should show
    // the Mach-O 64-bit magic, proving the address is real mapped
    // Mach-O, not an arbitrary unslid offset.
    let header = engine
        .read_memory(segment.segment_start, 4)
        .expect("read Mach-O magic at resolved __TEXT start");
    assert_eq!(header, machprobe::mach::MH_MAGIC_64.to_le_bytes().to_vec());
}

/// Same `__TEXT` lookup as `resolves_own_text_segment`, but formatted as a
/// multi-line `segname`/`vmaddr`/`vmsize` block and diffed against otool's
/// own formatting of those three fields, the way the load-command
/// enumeration test compares its full dump.
#[test]
fn text_segment_field_dump_matches_otool() {
    let engine = Engine::current_task();
    let locator = Locator::new(&engine);

    let exe_path = std::env::current_exe().expect("current exe path");
    let exe_name = exe_path
        .file_name()
        .and_then(|n| n.to_str())
        .expect("exe file name");

    let image = locator.locate(exe_name).expect("locate self image");
    let segment = locator
        .resolve_segment(&image, "__TEXT")
        .expect("resolve __TEXT");

    let lc_str = call_otool(&["-l"]);
    let text_block_start = lc_str.find("segname __TEXT").expect("otool lists __TEXT");
    let block = &lc_str[text_block_start..];

    let mut expected = String::new();
    for line in block.lines() {
        let field = line.trim_start();
        if field.starts_with("segname")
            || field.starts_with("vmaddr")
            || field.starts_with("vmsize")
        {
            expected.push_str(line);
            expected.push('\n');
        } else if !expected.is_empty() {
            break;
        }
    }

    // otool reports the unslid link-time vmaddr; recover it by undoing
    // the slide the locator applied.
    let unslid_vmaddr = segment.segment_start as i64 - image.slide;

    let mut actual = String::new();
    write!(
        &mut actual,
        "  segname __TEXT\n   vmaddr 0x{unslid_vmaddr:x}\n   vmsize 0x{:x}\n",
        segment.len()
    )
    .unwrap();

    similar_asserts::assert_str_eq!(expected, actual);
}

#[test]
fn locate_rejects_unknown_substring() {
    let engine = Engine::current_task();
    let locator = Locator::new(&engine);

    let result = locator.locate("definitely-not-a-loaded-image-xyz");
    assert!(result.is_err());
}
