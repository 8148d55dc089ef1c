//! Marker search over stitched streams

use super::container::MarkerPattern;
use super::stream::Stream;

/// Every position where `pattern` matches `data`
pub(crate) fn scan(data: &[u8], pattern: &MarkerPattern) -> Vec<usize> {
    if pattern.is_empty() {
        return Vec::new();
    }

    let (anchor_offset, anchor) = pattern.anchor();
    if anchor.is_empty() {
        return Vec::new();
    }

    memchr::memmem::Finder::new(anchor)
        .find_iter(data)
        .filter_map(|anchor_pos| anchor_pos.checked_sub(anchor_offset))
        .filter(|&start| pattern.matches(&data[start..]))
        .collect()
}

/// Stream offsets of every match whose bytes were all captured.
///
/// Sentinel-filled holes can never produce a marker.
pub(crate) fn find_marker(stream: &Stream, pattern: &MarkerPattern) -> Vec<u64> {
    scan(&stream.bytes, pattern)
        .into_iter()
        .map(|pos| pos as u64)
        .filter(|&pos| {
            stream
                .presence
                .is_range_present(pos, pos + pattern.len() as u64)
        })
        .collect()
}
