use crate::colormap::{normalize, value_range, Colormap};
use crate::profile::PipelineProfile;
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::imageops;
use image::{DynamicImage, GrayImage, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology;

pub const BACKDROP_OPACITY: f32 = 0.35;
pub const MAX_PAIR_LINES: usize = 2000;

const GLYPH: i32 = 8;
const LEGEND_ORIGIN: i32 = 25;
const LEGEND_BOX: i32 = 36;
const LEGEND_GAP: i32 = 14;
const LEGEND_PAD: i32 = 12;
const LEGEND_TEXT_SCALE: u32 = 3;
const BAR_WIDTH: u32 = 20;
const BAR_PAD: i32 = 10;
const BAR_NUM_GAP: i32 = 12;
const BAR_NUM_SCALE: u32 = 2;
const BAR_LABEL_SCALE: u32 = 2;
const BAR_LABEL_MIN_OFFSET: i32 = 62;
const BANNER_TEXT_SCALE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerScope {
    /// Drawn over both the background and the overlay layer.
    AllLayers,
    OverlayOnly,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Rect { x: i32, y: i32, w: u32, h: u32 },
    Disc { cx: f64, cy: f64, radius: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextDirection {
    Horizontal,
    /// Reads bottom to top.
    Up,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Shape {
        shape: Shape,
        fill: Rgba<u8>,
    },
    Text {
        x: i32,
        y: i32,
        text: String,
        color: Rgba<u8>,
        scale: u32,
        direction: TextDirection,
    },
    Line {
        from: (f64, f64),
        to: (f64, f64),
        color: Rgba<u8>,
        width: f64,
    },
    ImagePatch {
        x: i32,
        y: i32,
        image: RgbaImage,
        opacity: f32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayItem {
    pub primitive: Primitive,
    pub scope: LayerScope,
}

impl OverlayItem {
    fn all(primitive: Primitive) -> Self {
        Self {
            primitive,
            scope: LayerScope::AllLayers,
        }
    }

    fn overlay_only(primitive: Primitive) -> Self {
        Self {
            primitive,
            scope: LayerScope::OverlayOnly,
        }
    }

    pub fn draw(&self, img: &mut RgbaImage) {
        match &self.primitive {
            Primitive::Shape { shape, fill } => match *shape {
                Shape::Rect { x, y, w, h } => {
                    if w > 0 && h > 0 {
                        fill_rect_alpha(img, x, y, x + w as i32 - 1, y + h as i32 - 1, *fill);
                    }
                }
                Shape::Disc { cx, cy, radius } => draw_disc(img, cx, cy, radius, *fill),
            },
            Primitive::Text {
                x,
                y,
                text,
                color,
                scale,
                direction,
            } => match direction {
                TextDirection::Horizontal => draw_bitmap_text(img, *x, *y, text, *color, *scale),
                TextDirection::Up => draw_text_up(img, *x, *y, text, *color, *scale),
            },
            Primitive::Line {
                from,
                to,
                color,
                width,
            } => draw_thick_line(img, from.0, from.1, to.0, to.1, *color, *width),
            Primitive::ImagePatch {
                x,
                y,
                image,
                opacity,
            } => blit(img, image, *x, *y, *opacity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Background,
    Overlay,
}

/// Paint `items` in order over a copy of `base`. The background layer only takes items
/// scoped to all layers.
pub fn render_layer<'a>(
    base: &RgbImage,
    items: impl IntoIterator<Item = &'a OverlayItem>,
    layer: Layer,
) -> RgbImage {
    let mut canvas = DynamicImage::ImageRgb8(base.clone()).to_rgba8();
    for item in items {
        if layer == Layer::Background && item.scope == LayerScope::OverlayOnly {
            continue;
        }
        item.draw(&mut canvas);
    }
    DynamicImage::ImageRgba8(canvas).to_rgb8()
}

/// Scientific notation for very large or very small magnitudes, three decimals otherwise.
/// Exponents carry a sign and at least two digits: `1.50e+02`.
pub fn format_value(v: f64) -> String {
    if v.abs() >= 100.0 || v.abs() < 0.01 {
        let raw = format!("{v:.2e}");
        let Some((mantissa, exp)) = raw.split_once('e') else {
            return raw;
        };
        let (sign, digits) = match exp.strip_prefix('-') {
            Some(digits) => ('-', digits),
            None => ('+', exp),
        };
        format!("{mantissa}e{sign}{digits:0>2}")
    } else {
        format!("{v:.3}")
    }
}

fn rgba(c: Rgb<u8>) -> Rgba<u8> {
    Rgba([c.0[0], c.0[1], c.0[2], 255])
}

fn backdrop(x: i32, y: i32, w: u32, h: u32) -> Primitive {
    let alpha = (BACKDROP_OPACITY * 255.0).round() as u8;
    Primitive::Shape {
        shape: Shape::Rect { x, y, w, h },
        fill: Rgba([0, 0, 0, alpha]),
    }
}

pub fn legend_items(profile: &PipelineProfile) -> Vec<OverlayItem> {
    let entries = profile.legend_entries();
    if entries.is_empty() {
        return Vec::new();
    }
    let n = entries.len() as i32;
    let max_text = entries
        .iter()
        .map(|c| text_width(&c.name, LEGEND_TEXT_SCALE))
        .max()
        .unwrap_or(0);
    let panel_w = LEGEND_BOX + 16 + max_text + LEGEND_PAD * 2;
    let panel_h = n * LEGEND_BOX + (n - 1) * LEGEND_GAP + LEGEND_PAD * 2;

    let mut items = vec![OverlayItem::all(backdrop(
        LEGEND_ORIGIN - LEGEND_PAD,
        LEGEND_ORIGIN - LEGEND_PAD,
        panel_w as u32,
        panel_h as u32,
    ))];
    let text_offset = (LEGEND_BOX - GLYPH * LEGEND_TEXT_SCALE as i32) / 2;
    let mut y = LEGEND_ORIGIN;
    for class in entries {
        let [r, g, b] = class.color;
        items.push(OverlayItem::all(Primitive::Shape {
            shape: Shape::Rect {
                x: LEGEND_ORIGIN,
                y,
                w: LEGEND_BOX as u32,
                h: LEGEND_BOX as u32,
            },
            fill: Rgba([r, g, b, 255]),
        }));
        items.push(OverlayItem::all(Primitive::Text {
            x: LEGEND_ORIGIN + LEGEND_BOX + 16,
            y: y + text_offset,
            text: class.name.clone(),
            color: Rgba([255, 255, 255, 255]),
            scale: LEGEND_TEXT_SCALE,
            direction: TextDirection::Horizontal,
        }));
        y += LEGEND_BOX + LEGEND_GAP;
    }
    items
}

/// Placement of a vertical colour bar on an image of the given size.
pub fn color_bar_geometry(img_w: u32, img_h: u32, slot: u32) -> (i32, i32, u32, u32) {
    let h = (img_h / 4).max(120);
    let x = img_w as i32 - 110;
    let y = 40 + (slot * (h + 100)) as i32;
    (x, y, BAR_WIDTH, h)
}

#[allow(clippy::too_many_arguments)]
pub fn color_bar_items(
    img_w: u32,
    img_h: u32,
    slot: u32,
    lo: f64,
    hi: f64,
    label: &str,
    colormap: Colormap,
) -> Vec<OverlayItem> {
    let (x, y, w, h) = color_bar_geometry(img_w, img_h, slot);
    let top = format_value(hi);
    let bottom = format_value(lo);
    let max_num_w = text_width(&top, BAR_NUM_SCALE).max(text_width(&bottom, BAR_NUM_SCALE));
    // rotated label column sits right of the widest tick number
    let label_x = (x + BAR_LABEL_MIN_OFFSET).max(x + w as i32 + BAR_NUM_GAP + max_num_w + BAR_NUM_GAP);
    let label_h = GLYPH * BAR_LABEL_SCALE as i32;
    let panel_w = if label.is_empty() {
        w as i32 + BAR_NUM_GAP + max_num_w + BAR_PAD * 2
    } else {
        label_x + label_h + BAR_PAD - (x - BAR_PAD)
    };
    let panel_h = h as i32 + BAR_PAD * 2;

    let mut gradient = RgbaImage::new(w, h);
    for yy in 0..h {
        let t = if h > 1 {
            1.0 - f64::from(yy) / f64::from(h - 1)
        } else {
            1.0
        };
        let color = rgba(colormap.map(t));
        for xx in 0..w {
            gradient.put_pixel(xx, yy, color);
        }
    }

    let white = Rgba([255, 255, 255, 255]);
    let num_h = GLYPH * BAR_NUM_SCALE as i32;
    let mut items = vec![
        OverlayItem::all(backdrop(x - BAR_PAD, y - BAR_PAD, panel_w as u32, panel_h as u32)),
        OverlayItem::all(Primitive::ImagePatch {
            x,
            y,
            image: gradient,
            opacity: 1.0,
        }),
        OverlayItem::all(Primitive::Text {
            x: x + w as i32 + BAR_NUM_GAP,
            y,
            text: top,
            color: white,
            scale: BAR_NUM_SCALE,
            direction: TextDirection::Horizontal,
        }),
        OverlayItem::all(Primitive::Text {
            x: x + w as i32 + BAR_NUM_GAP,
            y: y + h as i32 - num_h,
            text: bottom,
            color: white,
            scale: BAR_NUM_SCALE,
            direction: TextDirection::Horizontal,
        }),
    ];
    if !label.is_empty() {
        let len = text_width(label, BAR_LABEL_SCALE);
        items.push(OverlayItem::all(Primitive::Text {
            x: label_x,
            y: y + (h as i32 - len) / 2,
            text: label.to_string(),
            color: white,
            scale: BAR_LABEL_SCALE,
            direction: TextDirection::Up,
        }));
    }
    items
}

/// One small disc per point, coloured by its value. Returns the items and the value range.
pub fn point_marker_items(points: &[(f64, f64, f64)], colormap: Colormap) -> (Vec<OverlayItem>, (f64, f64)) {
    let (lo, hi) = value_range(points.iter().map(|p| p.2));
    let items = points
        .iter()
        .map(|&(x, y, v)| {
            OverlayItem::overlay_only(Primitive::Shape {
                shape: Shape::Disc {
                    cx: x.round(),
                    cy: y.round(),
                    radius: 1.0,
                },
                fill: rgba(colormap.map(normalize(v, lo, hi))),
            })
        })
        .collect();
    (items, (lo, hi))
}

/// Pair segments coloured by their (calibrated) length; at most `MAX_PAIR_LINES` drawn.
pub fn pair_line_items(
    pairs: &[((f64, f64), (f64, f64), f64)],
    colormap: Colormap,
) -> (Vec<OverlayItem>, (f64, f64)) {
    let (lo, hi) = value_range(pairs.iter().map(|p| p.2));
    let items = pairs
        .iter()
        .take(MAX_PAIR_LINES)
        .map(|&(from, to, v)| {
            OverlayItem::overlay_only(Primitive::Line {
                from,
                to,
                color: rgba(colormap.map(normalize(v, lo, hi))),
                width: 1.0,
            })
        })
        .collect();
    (items, (lo, hi))
}

/// Grow a binary mask by `iterations` 8-connected rings (chessboard distance).
pub fn dilate(mask: &GrayImage, iterations: u32) -> GrayImage {
    if iterations == 0 {
        return mask.clone();
    }
    morphology::dilate(mask, Norm::LInf, iterations.min(u32::from(u8::MAX)) as u8)
}

/// Tint the non-zero pixels of an edge mask; `thickness - 1` dilations widen the edges.
pub fn contour_item(edges: &GrayImage, color: [u8; 3], thickness: u32, origin: (i32, i32)) -> OverlayItem {
    let grown = dilate(edges, thickness.saturating_sub(1));
    let (w, h) = grown.dimensions();
    let [r, g, b] = color;
    let patch = RgbaImage::from_fn(w, h, |x, y| {
        if grown.get_pixel(x, y).0[0] != 0 {
            Rgba([r, g, b, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    });
    OverlayItem::overlay_only(Primitive::ImagePatch {
        x: origin.0,
        y: origin.1,
        image: patch,
        opacity: 1.0,
    })
}

pub fn stats_banner_items(img_w: u32, img_h: u32, line: &str) -> Vec<OverlayItem> {
    let text_h = GLYPH as u32 * BANNER_TEXT_SCALE + 4;
    let panel_h = text_h.min(img_h.max(1));
    let y = img_h.saturating_sub(panel_h) as i32;
    vec![
        OverlayItem::overlay_only(backdrop(0, y, img_w, panel_h)),
        OverlayItem::overlay_only(Primitive::Text {
            x: 0,
            y: y + 2,
            text: line.to_string(),
            color: Rgba([255, 255, 255, 255]),
            scale: BANNER_TEXT_SCALE,
            direction: TextDirection::Horizontal,
        }),
    ]
}

pub fn text_width(text: &str, scale: u32) -> i32 {
    let (x0, _, x1, _) = text_bbox(0, 0, text, scale);
    x1 - x0
}

fn clamp_i32(value: i32, min_value: i32, max_value: i32) -> i32 {
    value.max(min_value).min(max_value)
}

pub fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let mix = |d: u8, s: u8| (f64::from(d) * inv + f64::from(s) * a).round().clamp(0.0, 255.0) as u8;
    let out_a = (f64::from(src[3]) + f64::from(dst[3]) * inv)
        .round()
        .clamp(0.0, 255.0) as u8;
    Rgba([mix(dst[0], src[0]), mix(dst[1], src[1]), mix(dst[2], src[2]), out_a])
}

fn put_blended(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && x < img.width() as i32 && y < img.height() as i32 {
        let dst = *img.get_pixel(x as u32, y as u32);
        img.put_pixel(x as u32, y as u32, blend_pixel(dst, color));
    }
}

fn draw_disc(img: &mut RgbaImage, cx: f64, cy: f64, radius: f64, color: Rgba<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    if radius <= 0.1 {
        put_blended(img, cx.round() as i32, cy.round() as i32, color);
        return;
    }
    let min_x = clamp_i32((cx - radius).floor() as i32, 0, img.width() as i32 - 1);
    let max_x = clamp_i32((cx + radius).ceil() as i32, 0, img.width() as i32 - 1);
    let min_y = clamp_i32((cy - radius).floor() as i32, 0, img.height() as i32 - 1);
    let max_y = clamp_i32((cy + radius).ceil() as i32, 0, img.height() as i32 - 1);
    let r2 = radius * radius;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let dx = f64::from(x) - cx;
            let dy = f64::from(y) - cy;
            if dx * dx + dy * dy <= r2 {
                put_blended(img, x, y, color);
            }
        }
    }
}

fn draw_thick_line(img: &mut RgbaImage, x1: f64, y1: f64, x2: f64, y2: f64, color: Rgba<u8>, width: f64) {
    let dx = x2 - x1;
    let dy = y2 - y1;
    let distance = (dx * dx + dy * dy).sqrt();
    let steps = distance.max(1.0).ceil() as i32;
    let radius = (width.max(1.0) / 2.0).max(0.6);
    let mut last = None;
    for step in 0..=steps {
        let t = f64::from(step) / f64::from(steps.max(1));
        let x = x1 + dx * t;
        let y = y1 + dy * t;
        // Translucent colours must not compound where consecutive discs overlap.
        let key = (x.round() as i64, y.round() as i64);
        if color[3] < 255 && last == Some(key) {
            continue;
        }
        last = Some(key);
        draw_disc(img, x, y, radius, color);
    }
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.max(1) as i32;
    let mut cursor_x = x;
    let mut cursor_y = y;
    for ch in text.chars() {
        if ch == '\n' {
            cursor_x = x;
            cursor_y += GLYPH * scale_i;
            continue;
        }
        let glyph = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?'));
        let Some(glyph) = glyph else {
            cursor_x += GLYPH * scale_i;
            continue;
        };
        for (row_idx, row) in glyph.iter().enumerate() {
            for col_idx in 0..8 {
                if (*row >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col_idx * scale_i;
                let py = cursor_y + row_idx as i32 * scale_i;
                for sy in 0..scale_i {
                    for sx in 0..scale_i {
                        put_blended(img, px + sx, py + sy, color);
                    }
                }
            }
        }
        cursor_x += GLYPH * scale_i;
    }
}

fn draw_text_up(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let (x0, y0, x1, y1) = text_bbox(0, 0, text, scale);
    let (w, h) = ((x1 - x0).max(1) as u32, (y1 - y0).max(1) as u32);
    let mut scratch = RgbaImage::new(w, h);
    draw_bitmap_text(&mut scratch, 0, 0, text, color, scale);
    let rotated = imageops::rotate270(&scratch);
    blit(img, &rotated, x, y, 1.0);
}

fn text_bbox(x: i32, y: i32, text: &str, scale: u32) -> (i32, i32, i32, i32) {
    let scale_i = scale.max(1) as i32;
    let lines: Vec<&str> = text.split('\n').collect();
    let width_chars = lines
        .iter()
        .map(|line| line.chars().count() as i32)
        .max()
        .unwrap_or(0);
    let line_count = lines.len().max(1) as i32;
    (
        x,
        y,
        x + width_chars * GLYPH * scale_i,
        y + line_count * GLYPH * scale_i,
    )
}

fn fill_rect_alpha(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    if w == 0 || h == 0 || x0.max(x1) < 0 || y0.max(y1) < 0 || x0.min(x1) >= w || y0.min(y1) >= h {
        return;
    }
    let min_x = clamp_i32(x0.min(x1), 0, w - 1);
    let max_x = clamp_i32(x0.max(x1), 0, w - 1);
    let min_y = clamp_i32(y0.min(y1), 0, h - 1);
    let max_y = clamp_i32(y0.max(y1), 0, h - 1);
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            put_blended(img, x, y, color);
        }
    }
}

fn blit(img: &mut RgbaImage, patch: &RgbaImage, x: i32, y: i32, opacity: f32) {
    let opacity = opacity.clamp(0.0, 1.0);
    for (px, py, pixel) in patch.enumerate_pixels() {
        let a = (f32::from(pixel[3]) * opacity).round() as u8;
        if a == 0 {
            continue;
        }
        put_blended(img, x + px as i32, y + py as i32, Rgba([pixel[0], pixel[1], pixel[2], a]));
    }
}
