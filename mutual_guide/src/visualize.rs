use std::{fs, path::Path};

use ab_glyph::{FontVec, PxScale};
use anyhow::Context;
use image::{Rgb, RgbImage};
use imageproc::{drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut}, rect::Rect};

use crate::detections::DetectionSet;

/// Detections at or below this score are not drawn.
pub const VIS_THRESH: f32 = 0.25;

const TAG_HEIGHT: i32 = 15;
const CHAR_WIDTH: u32 = 9;
const CAPTION_HEIGHT: u32 = 20;

/// Fixed color per class id, evenly spread around the hue circle.
#[derive(Debug, Clone)]
pub struct Palette {
    colors: Vec<Rgb<u8>>,
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    let (r, g, b) = match sector as i32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    Rgb([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8])
}

impl Palette {
    pub fn new(num_classes: usize) -> Self {
        // golden-ratio hue steps keep neighbouring ids apart
        let colors = (0..num_classes)
            .map(|class| hsv_to_rgb((class as f32 * 0.618_034).fract(), 0.75, 0.95))
            .collect();
        Self { colors }
    }

    pub fn color(&self, class: usize) -> Rgb<u8> {
        match self.colors.len() {
            0 => Rgb([255, 255, 255]),
            n => self.colors[class % n],
        }
    }
}

pub struct Visualizer {
    palette: Palette,
    class_names: Vec<String>,
    font: Option<FontVec>,
}

impl Visualizer {
    pub fn new(class_names: Vec<String>, font_path: Option<&str>) -> anyhow::Result<Self> {
        let font = match font_path {
            Some(path) => {
                let bytes = fs::read(path).with_context(|| format!("Failed to read font {path}"))?;
                Some(FontVec::try_from_vec(bytes).with_context(|| format!("Invalid font {path}"))?)
            }
            None => None,
        };
        Ok(Self {
            palette: Palette::new(class_names.len()),
            class_names,
            font,
        })
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    /// Draws every detection of `image` scoring above [`VIS_THRESH`]: a 2px
    /// box plus a filled tag with the class name and score.
    pub fn draw_detections(&self, canvas: &mut RgbImage, detections: &DetectionSet, image: usize) -> usize {
        let mut drawn = 0;
        for class in 0..detections.num_classes() {
            let color = self.palette.color(class);
            let name = self.class_names.get(class).map(String::as_str).unwrap_or("?");

            let dets = detections.get(class, image);
            for r in (0..dets.nrows()).rev() {
                let row = dets.row(r);
                let score = row[4];
                if score <= VIS_THRESH {
                    continue;
                }
                let (x1, y1, x2, y2) = (row[0] as i32, row[1] as i32, row[2] as i32, row[3] as i32);
                let width = (x2 - x1).max(1) as u32;
                let height = (y2 - y1).max(1) as u32;
                draw_hollow_rect_mut(canvas, Rect::at(x1, y1).of_size(width, height), color);
                draw_hollow_rect_mut(
                    canvas,
                    Rect::at(x1 + 1, y1 + 1).of_size(width.saturating_sub(2).max(1), height.saturating_sub(2).max(1)),
                    color,
                );

                let label = format!("{name}{score:.2}");
                self.draw_tag(canvas, x1, y1 - TAG_HEIGHT, &label, color, Rgb([255, 255, 255]), TAG_HEIGHT as u32);
                drawn += 1;
            }
        }
        drawn
    }

    /// Black banner in the top-left corner.
    pub fn draw_caption(&self, canvas: &mut RgbImage, caption: &str) {
        self.draw_tag(canvas, 0, 0, caption, Rgb([0, 0, 0]), Rgb([255, 255, 0]), CAPTION_HEIGHT);
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_tag(&self, canvas: &mut RgbImage, x: i32, y: i32, text: &str, fill: Rgb<u8>, ink: Rgb<u8>, height: u32) {
        let width = (text.chars().count() as u32 * CHAR_WIDTH).max(1);
        draw_filled_rect_mut(canvas, Rect::at(x, y).of_size(width, height), fill);
        if let Some(font) = &self.font {
            let scale = PxScale::from(height as f32 - 3.0);
            draw_text_mut(canvas, ink, x, y + 1, scale, font, text);
        }
    }

    pub fn save(canvas: &RgbImage, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        canvas
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}
