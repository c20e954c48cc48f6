//! Tests for CLI mount and device request parsing.
//!
//! Covers the `A[:B[:C]]` token forms, the absoluteness-based
//! disambiguation of two-token requests, and the arity/validation errors.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use squashrun::device::DeviceAccess;
use squashrun::error::ErrorKind;
use squashrun::request::{parse_device_request, parse_mount_request};

fn assert_invalid_request(err: &squashrun::Error, fragment: &str) {
    assert!(
        matches!(err.kind(), ErrorKind::InvalidRequest(_)),
        "expected InvalidRequest, got {:?}",
        err.kind()
    );
    assert!(
        err.to_string().contains(fragment),
        "'{err}' should contain '{fragment}'"
    );
}

// =============================================================================
// Device Requests
// =============================================================================

#[test]
fn test_device_single_token_defaults_destination_and_access() {
    let mount = parse_device_request("/dev/nvidia0").unwrap();
    assert_eq!(mount.source, PathBuf::from("/dev/nvidia0"));
    assert_eq!(mount.destination, PathBuf::from("/dev/nvidia0"));
    assert_eq!(mount.access, DeviceAccess::full());
    assert_eq!(mount.flags, MsFlags::MS_REC | MsFlags::MS_PRIVATE);
}

#[test]
fn test_device_two_tokens_absolute_second_is_destination() {
    let mount = parse_device_request("/dev/nvidia0:/dev/gpu0").unwrap();
    assert_eq!(mount.source, PathBuf::from("/dev/nvidia0"));
    assert_eq!(mount.destination, PathBuf::from("/dev/gpu0"));
    assert_eq!(mount.access, DeviceAccess::full());
}

#[test]
fn test_device_two_tokens_relative_second_is_access() {
    let mount = parse_device_request("/dev/nvidia0:rw").unwrap();
    assert_eq!(mount.source, PathBuf::from("/dev/nvidia0"));
    assert_eq!(mount.destination, PathBuf::from("/dev/nvidia0"));
    assert_eq!(mount.access, DeviceAccess::parse("rw").unwrap());
}

#[test]
fn test_device_three_tokens() {
    let mount = parse_device_request("/dev/nvidia0:/dev/gpu0:m").unwrap();
    assert_eq!(mount.source, PathBuf::from("/dev/nvidia0"));
    assert_eq!(mount.destination, PathBuf::from("/dev/gpu0"));
    assert_eq!(mount.access, DeviceAccess::parse("m").unwrap());
}

#[test]
fn test_device_round_trips_to_request_triple() {
    // Parsing "a:b:c" with absolute paths and re-emitting source,
    // destination and access reproduces the triple (access normalized).
    let mount = parse_device_request("/dev/a:/dev/b:mrw").unwrap();
    let rendered = format!(
        "{}:{}:{}",
        mount.source.display(),
        mount.destination.display(),
        mount.access
    );
    assert_eq!(rendered, "/dev/a:/dev/b:rwm");

    let reparsed = parse_device_request(&rendered).unwrap();
    assert_eq!(reparsed, mount);
}

#[test]
fn test_device_relative_second_token_that_is_no_access_fails_clearly() {
    // 'relative' can be neither a container path (not absolute) nor an
    // access string (bad letters); the error explains the disambiguation.
    let err = parse_device_request("/dev/x:relative").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidRequest(_)));
    let trace = err.format_trace();
    assert!(
        trace.contains("taken as an access string"),
        "trace should explain the disambiguation: {trace}"
    );
}

#[test]
fn test_device_empty_request_fails() {
    let err = parse_device_request("").unwrap_err();
    assert_invalid_request(&err, "no values provided");
}

#[test]
fn test_device_too_many_tokens_fails() {
    let err = parse_device_request("a:b:c:d").unwrap_err();
    assert_invalid_request(&err, "too many tokens");
}

#[test]
fn test_device_relative_source_fails() {
    let err = parse_device_request("dev/nvidia0").unwrap_err();
    assert_invalid_request(&err, "must be absolute");
}

#[test]
fn test_device_empty_path_component_fails() {
    let err = parse_device_request(":/dev/gpu0:rw").unwrap_err();
    assert_invalid_request(&err, "empty");
}

#[test]
fn test_device_bad_access_in_three_token_form_fails() {
    let err = parse_device_request("/dev/a:/dev/b:rwz").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidRequest(_)));
}

#[test]
fn test_device_parser_does_not_touch_the_filesystem() {
    // The node clearly does not exist; parsing must still succeed.
    let mount = parse_device_request("/dev/does-not-exist-9999").unwrap();
    assert_eq!(mount.source, Path::new("/dev/does-not-exist-9999"));
}

// =============================================================================
// Mount Requests
// =============================================================================

#[test]
fn test_mount_single_token() {
    let mount = parse_mount_request("/scratch").unwrap();
    assert_eq!(mount.source, PathBuf::from("/scratch"));
    assert_eq!(mount.destination, PathBuf::from("/scratch"));
    assert!(!mount.read_only);
    assert_eq!(mount.flags, MsFlags::MS_REC | MsFlags::MS_PRIVATE);
}

#[test]
fn test_mount_two_tokens_absolute_second_is_destination() {
    let mount = parse_mount_request("/scratch:/data").unwrap();
    assert_eq!(mount.source, PathBuf::from("/scratch"));
    assert_eq!(mount.destination, PathBuf::from("/data"));
    assert!(!mount.read_only);
}

#[test]
fn test_mount_two_tokens_relative_second_is_options() {
    let mount = parse_mount_request("/scratch:ro").unwrap();
    assert_eq!(mount.destination, PathBuf::from("/scratch"));
    assert!(mount.read_only);
}

#[test]
fn test_mount_three_tokens_with_option_list() {
    let mount = parse_mount_request("/scratch:/data:bind,ro").unwrap();
    assert_eq!(mount.destination, PathBuf::from("/data"));
    assert!(mount.read_only);

    let rw = parse_mount_request("/scratch:/data:bind,rw").unwrap();
    assert!(!rw.read_only);
}

#[test]
fn test_mount_unknown_option_fails() {
    let err = parse_mount_request("/scratch:/data:loop").unwrap_err();
    assert_invalid_request(&err, "unknown mount option");
}

#[test]
fn test_mount_empty_request_fails() {
    let err = parse_mount_request("").unwrap_err();
    assert_invalid_request(&err, "no values provided");
}

#[test]
fn test_mount_too_many_tokens_fails() {
    let err = parse_mount_request("/a:/b:ro:rw").unwrap_err();
    assert_invalid_request(&err, "too many tokens");
}

#[test]
fn test_mount_relative_paths_fail() {
    assert!(parse_mount_request("scratch").is_err());
    assert!(parse_mount_request("/scratch:data/sub:ro").is_err());
}
