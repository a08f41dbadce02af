//! Fuzz harness for the creative parsers.
//!
//! Feeds arbitrary bytes through metadata extraction, the streaming head
//! parser and the header parsers. None of them may panic, whatever the
//! input.

#![no_main]
use fastfetch_core::head::{AllowlistHeadSanitizer, HeadSanitizer, HeadStreamParser};
use fastfetch_core::headers::{parse_experiment_features, parse_render_mode, parse_size};
use fastfetch_core::metadata::extract_metadata_from_bytes;
use fastfetch_core::signature::SignatureHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = extract_metadata_from_bytes(data, false);
    let _ = extract_metadata_from_bytes(data, true);

    // Split at a data-dependent point so chunk boundaries vary.
    let split = data.first().map_or(0, |b| usize::from(*b) % (data.len() + 1));
    let mut parser = HeadStreamParser::new();
    parser.push(&data[..split]);
    parser.push(&data[split..]);
    let result = parser.finish();
    assert_eq!(result.total_bytes, data.len());
    if let Some(head) = result.head {
        let _ = AllowlistHeadSanitizer.process_head(&head);
    }

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = SignatureHeader::parse(text);
        let _ = parse_experiment_features(text);
        let _ = parse_render_mode(text);
        let _ = parse_size(text);
    }
});
