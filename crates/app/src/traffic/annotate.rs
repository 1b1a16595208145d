//! Frame annotation and JPEG encoding.
//!
//! Detections are drawn as outlined boxes with label plates; tracked
//! vehicles additionally get a centroid marker, a trajectory trail, and a
//! direction/speed readout. The annotated frame is downscaled to a
//! bandwidth-bounded width before lossy encoding.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use image::{codecs::jpeg::JpegEncoder, imageops, DynamicImage, ImageBuffer, Rgba};
use video_ingest::Frame;

use crate::traffic::data::{Detection, TrackSnapshot, VehicleClass};

type Canvas = ImageBuffer<Rgba<u8>, Vec<u8>>;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK_PLATE: Rgba<u8> = Rgba([0, 0, 0, 180]);
const TITLE: Rgba<u8> = Rgba([0, 255, 255, 255]);
const LIVE_RED: Rgba<u8> = Rgba([255, 60, 60, 255]);

#[derive(Clone, Copy, Debug)]
pub struct AnnotateOptions {
    pub resize_width: u32,
    pub jpeg_quality: u8,
    pub show_timestamp: bool,
}

fn class_color(class: VehicleClass) -> Rgba<u8> {
    match class {
        VehicleClass::Car => Rgba([0, 255, 0, 255]),
        VehicleClass::Motorcycle => Rgba([255, 165, 0, 255]),
        VehicleClass::Bus => Rgba([0, 128, 255, 255]),
        VehicleClass::Truck => Rgba([200, 0, 200, 255]),
        VehicleClass::Bicycle => Rgba([255, 255, 0, 255]),
    }
}

/// Draw detections and track overlays onto the frame and return it as an
/// encoded JPEG, downscaled to at most `resize_width` pixels wide.
pub fn render(
    frame: &Frame,
    detections: &[Detection],
    tracks: &[TrackSnapshot],
    options: AnnotateOptions,
) -> Result<Vec<u8>> {
    let width = frame.width as u32;
    let height = frame.height as u32;
    let rgba = bgr_to_rgba(&frame.data);
    let mut image = Canvas::from_vec(width, height, rgba)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    let track_lookup: HashMap<i64, &TrackSnapshot> =
        tracks.iter().map(|t| (t.track_id, t)).collect();

    draw_hud(&mut image, tracks.len(), detections.len());

    for det in detections {
        let color = class_color(det.class);
        let [x1, y1, x2, y2] = det.bbox;
        draw_rectangle(&mut image, x1, y1, x2, y2, color);

        let track = det.track_id.and_then(|id| track_lookup.get(&id));

        let mut label = format!("{} {:.0}%", det.class.label(), det.confidence * 100.0);
        if let Some(track) = track {
            if track.speed_kmh > 0.0 {
                label.push_str(&format!(" | {}KM/H", track.speed_kmh.round() as i32));
            }
            if track.frames_tracked > 10 {
                label.push_str(" [STABLE]");
            }
        }

        let label_y = (y1 - 12).max(0);
        let label_w = label.chars().count() as i32 * 6;
        fill_rect(&mut image, x1, label_y, x1 + label_w + 4, label_y + 9, color);
        draw_label(&mut image, x1 + 2, label_y + 1, &label, Rgba([0, 0, 0, 255]));

        if let Some(track) = track {
            draw_track_overlay(&mut image, track, color, x1, y1);
        }
    }

    if options.show_timestamp {
        draw_timestamp(&mut image, frame.timestamp_ms);
    }

    encode_jpeg(image, options)
}

fn draw_hud(image: &mut Canvas, active_tracks: usize, detections: usize) {
    fill_rect(image, 4, 4, 200, 44, BLACK_PLATE);
    draw_label(image, 10, 8, "TRAFFIC MONITOR", TITLE);
    draw_label(image, 10, 20, &format!("ACTIVE TRACKS: {active_tracks}"), WHITE);
    draw_label(image, 10, 32, &format!("DETECTIONS: {detections}"), WHITE);
}

fn draw_track_overlay(image: &mut Canvas, track: &TrackSnapshot, color: Rgba<u8>, x1: i32, y1: i32) {
    let cx = track.centroid[0].round() as i32;
    let cy = track.centroid[1].round() as i32;
    fill_rect(image, cx - 2, cy - 2, cx + 2, cy + 2, color);
    draw_rectangle(image, cx - 3, cy - 3, cx + 3, cy + 3, WHITE);

    if track.trajectory.len() > 1 {
        for pair in track.trajectory.windows(2) {
            draw_line(
                image,
                pair[0][0].round() as i32,
                pair[0][1].round() as i32,
                pair[1][0].round() as i32,
                pair[1][1].round() as i32,
                color,
            );
        }
    }

    if track.direction != "Unknown" {
        draw_label(image, x1, (y1 - 24).max(0), &track.direction, color);
    }
}

fn draw_timestamp(image: &mut Canvas, timestamp_ms: i64) {
    let width = image.width() as i32;
    let stamp = chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();

    let text_w = stamp.chars().count() as i32 * 6;
    let x = (width - text_w - 10).max(0);
    fill_rect(image, x - 40, 6, x + text_w + 4, 18, BLACK_PLATE);
    fill_rect(image, x - 34, 9, x - 28, 15, LIVE_RED);
    draw_label(image, x - 24, 9, "LIVE", LIVE_RED);
    draw_label(image, x, 9, &stamp, TITLE);
}

fn encode_jpeg(image: Canvas, options: AnnotateOptions) -> Result<Vec<u8>> {
    let (width, height) = image.dimensions();
    let image = DynamicImage::ImageRgba8(image);

    let image = if width > options.resize_width {
        let new_height =
            ((height as u64 * options.resize_width as u64) / width as u64).max(1) as u32;
        image.resize_exact(options.resize_width, new_height, imageops::FilterType::Triangle)
    } else {
        image
    };

    let rgb = image.to_rgb8();
    let mut buffer = Vec::new();
    let quality = options.jpeg_quality.clamp(1, 100);
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(&rgb)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn bgr_to_rgba(input: &[u8]) -> Vec<u8> {
    let pixels = input.len() / 3;
    let mut output = Vec::with_capacity(pixels * 4);
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
        output.push(255);
    }
    output
}

fn draw_rectangle(image: &mut Canvas, left: i32, top: i32, right: i32, bottom: i32, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for x in left..=right {
        *image.get_pixel_mut(x as u32, top as u32) = color;
        *image.get_pixel_mut(x as u32, bottom as u32) = color;
    }
    for y in top..=bottom {
        *image.get_pixel_mut(left as u32, y as u32) = color;
        *image.get_pixel_mut(right as u32, y as u32) = color;
    }
}

fn fill_rect(image: &mut Canvas, left: i32, top: i32, right: i32, bottom: i32, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            *image.get_pixel_mut(x as u32, y as u32) = color;
        }
    }
}

fn draw_line(image: &mut Canvas, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (x0, y0);

    loop {
        if x >= 0 && x < width && y >= 0 && y < height {
            *image.get_pixel_mut(x as u32, y as u32) = color;
        }
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn draw_label(image: &mut Canvas, mut x: i32, y: i32, text: &str, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            *image.get_pixel_mut(px as u32, py as u32) = color;
                        }
                    }
                }
            }
        }
        x += 6;
    }
}

#[rustfmt::skip]
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'B' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110]),
        'C' => Some([0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
        'D' => Some([0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100]),
        'E' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111]),
        'F' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000]),
        'G' => Some([0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111]),
        'H' => Some([0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'I' => Some([0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        'J' => Some([0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100]),
        'K' => Some([0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001]),
        'L' => Some([0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111]),
        'M' => Some([0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001]),
        'N' => Some([0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001]),
        'O' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'P' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000]),
        'Q' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101]),
        'R' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001]),
        'S' => Some([0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110]),
        'T' => Some([0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        'U' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'V' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100]),
        'W' => Some([0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001]),
        'X' => Some([0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b01010, 0b10001]),
        'Y' => Some([0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100]),
        'Z' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111]),
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        '%' => Some([0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000]),
        '(' => Some([0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010]),
        ')' => Some([0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000]),
        ':' => Some([0b00000, 0b00110, 0b00110, 0b00000, 0b00110, 0b00110, 0b00000]),
        '|' => Some([0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        '/' => Some([0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000]),
        '-' => Some([0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000]),
        '[' => Some([0b01110, 0b01000, 0b01000, 0b01000, 0b01000, 0b01000, 0b01110]),
        ']' => Some([0b01110, 0b00010, 0b00010, 0b00010, 0b00010, 0b00010, 0b01110]),
        '.' => Some([0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00110, 0b00110]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_ingest::FrameFormat;

    fn test_frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![80u8; (width * height * 3) as usize],
            width,
            height,
            seq: 1,
            timestamp_ms: 1_700_000_000_000,
            format: FrameFormat::Bgr8,
        }
    }

    fn options() -> AnnotateOptions {
        AnnotateOptions {
            resize_width: 320,
            jpeg_quality: 75,
            show_timestamp: true,
        }
    }

    #[test]
    fn render_produces_jpeg() {
        let frame = test_frame(640, 360);
        let detections = vec![Detection {
            class: VehicleClass::Car,
            confidence: 0.87,
            bbox: [100, 100, 220, 180],
            track_id: Some(3),
        }];
        let tracks = vec![TrackSnapshot {
            track_id: 3,
            class: VehicleClass::Car,
            bbox: [100, 100, 220, 180],
            centroid: [160.0, 140.0],
            speed_kmh: 42.0,
            direction: "Inbound (South)".into(),
            frames_tracked: 12,
            trajectory: vec![[150.0, 120.0], [155.0, 130.0], [160.0, 140.0]],
        }];

        let jpeg = render(&frame, &detections, &tracks, options()).unwrap();
        assert!(jpeg.len() > 2);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn wide_frames_are_downscaled() {
        let frame = test_frame(1280, 720);
        let jpeg = render(&frame, &[], &[], options()).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 320);
        assert_eq!(decoded.height(), 180);
    }

    #[test]
    fn narrow_frames_keep_their_size() {
        let frame = test_frame(160, 120);
        let jpeg = render(&frame, &[], &[], options()).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 160);
        assert_eq!(decoded.height(), 120);
    }

    #[test]
    fn font_covers_overlay_alphabet() {
        for label in [
            "TRAFFIC MONITOR",
            "ACTIVE TRACKS: 3",
            "CAR 87% | 42KM/H [STABLE]",
            "OUTBOUND (NORTHWEST)",
            "2024-05-01 12:30:00",
            "LIVE",
        ] {
            for ch in label.chars().flat_map(|c| c.to_uppercase()) {
                assert!(glyph_bits(ch).is_some(), "missing glyph for {ch:?}");
            }
        }
    }
}
