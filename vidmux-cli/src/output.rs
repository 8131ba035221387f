use std::fmt::Write;

use vidmux_engine::{Catalog, StreamDescriptor};

fn row(out: &mut String, stream: &StreamDescriptor) {
    let kind = if stream.combined {
        "video+audio"
    } else if stream.is_audio_only() {
        "audio"
    } else {
        "video"
    };
    let _ = writeln!(
        out,
        "  {:<10} {:<6} {:<11} {:<9} {:>10}",
        stream.id, stream.container, kind, stream.label, stream.size_label
    );
}

/// Human readable format list.
pub fn render_catalog(title: &str, catalog: &Catalog) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{title}");
    if catalog.is_empty() {
        out.push_str("  no downloadable formats\n");
        return out;
    }
    let _ = writeln!(
        out,
        "  {:<10} {:<6} {:<11} {:<9} {:>10}",
        "ID", "EXT", "KIND", "QUALITY", "SIZE"
    );
    for stream in catalog.video.iter().chain(&catalog.audio) {
        row(&mut out, stream);
    }
    out
}
