use crate::config::Binning;
use crate::error::{FillError, FillResult};
use crate::types::{SpatialUnit, UnitCollection};
use anyhow::{Context, Result};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use geo::{Point, Rect};
use image::{ImageBuffer, Rgba, RgbaImage};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Nine-class ColorBrewer sequential schemes.
const SCHEMES: &[(&str, [&str; 9])] = &[
    ("YlOrRd", ["#ffffcc", "#ffeda0", "#fed976", "#feb24c", "#fd8d3c", "#fc4e2a", "#e31a1c", "#bd0026", "#800026"]),
    ("YlGnBu", ["#ffffd9", "#edf8b1", "#c7e9b4", "#7fcdbb", "#41b6c4", "#1d91c0", "#225ea8", "#253494", "#081d58"]),
    ("BuPu", ["#f7fcfd", "#e0ecf4", "#bfd3e6", "#9ebcda", "#8c96c6", "#8c6bb1", "#88419d", "#810f7c", "#4d004b"]),
    ("OrRd", ["#fff7ec", "#fee8c8", "#fdd49e", "#fdbb84", "#fc8d59", "#ef6548", "#d7301f", "#b30000", "#7f0000"]),
    ("PuBu", ["#fff7fb", "#ece7f2", "#d0d1e6", "#a6bddb", "#74a9cf", "#3690c0", "#0570b0", "#045a8d", "#023858"]),
    ("Greens", ["#f7fcf5", "#e5f5e0", "#c7e9c0", "#a1d99b", "#74c476", "#41ab5d", "#238b45", "#006d2c", "#00441b"]),
    ("Blues", ["#f7fbff", "#deebf7", "#c6dbef", "#9ecae1", "#6baed6", "#4292c6", "#2171b5", "#08519c", "#08306b"]),
    ("Reds", ["#fff5f0", "#fee0d2", "#fcbba1", "#fc9272", "#fb6a4a", "#ef3b2c", "#cb181d", "#a50f15", "#67000d"]),
    ("Purples", ["#fcfbfd", "#efedf5", "#dadaeb", "#bcbddc", "#9e9ac8", "#807dba", "#6a51a3", "#54278f", "#3f007d"]),
];

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub attribute: String,
    pub palette: String,
    pub bins: usize,
    pub binning: Binning,
    pub nan_color: String,
    pub label: String,
    pub png_width: u32,
}

#[derive(Debug, Clone)]
pub struct RenderSummary {
    pub geojson: PathBuf,
    pub html: PathBuf,
    pub png: PathBuf,
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
    pub undefined: usize,
}

/// Bin edges over the defined values of an attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct BinScale {
    edges: Vec<f64>,
}

impl BinScale {
    /// Evenly spaced edges from the smallest to the largest value.
    pub fn equal_interval(values: &[f64], bins: usize) -> FillResult<Self> {
        let (min, max) = value_range(values, bins)?;
        let step = (max - min) / bins as f64;
        let mut edges: Vec<f64> = (0..bins).map(|i| min + step * i as f64).collect();
        edges.push(max);
        Ok(Self { edges })
    }

    /// Edges at evenly spaced quantiles, interpolating between sorted values.
    pub fn quantile(values: &[f64], bins: usize) -> FillResult<Self> {
        value_range(values, bins)?;
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let last = (sorted.len() - 1) as f64;
        let edges = (0..=bins)
            .map(|i| {
                let pos = last * i as f64 / bins as f64;
                let lo = pos.floor() as usize;
                let hi = pos.ceil() as usize;
                sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
            })
            .collect();
        Ok(Self { edges })
    }

    pub fn bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Bins are half-open except the last, which includes the maximum.
    pub fn bin_of(&self, value: f64) -> usize {
        let inner = &self.edges[1..self.edges.len() - 1];
        inner.iter().filter(|e| value >= **e).count().min(self.bins() - 1)
    }
}

fn value_range(values: &[f64], bins: usize) -> FillResult<(f64, f64)> {
    if bins == 0 {
        return Err(FillError::InvalidParameter("bin count must be at least 1".to_string()));
    }
    if values.is_empty() {
        return Err(FillError::InvalidData("no defined values to bin".to_string()));
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Ok((min, max))
}

/// A sequential color ramp sampled to a fixed number of classes.
#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    colors: Vec<Rgba<u8>>,
}

impl Palette {
    pub fn named(name: &str, classes: usize) -> FillResult<Self> {
        let scheme = SCHEMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, s)| s)
            .ok_or_else(|| FillError::InvalidParameter(format!("unknown palette '{}'", name)))?;
        let base = scheme
            .iter()
            .map(|h| hex_to_rgba(h))
            .collect::<FillResult<Vec<_>>>()?;

        let colors = (0..classes)
            .map(|i| {
                let t = if classes == 1 {
                    0.5
                } else {
                    i as f64 / (classes - 1) as f64
                };
                sample(&base, t)
            })
            .collect();
        Ok(Self { colors })
    }

    pub fn color(&self, class: usize) -> Rgba<u8> {
        self.colors[class.min(self.colors.len() - 1)]
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

fn sample(base: &[Rgba<u8>], t: f64) -> Rgba<u8> {
    let pos = t.clamp(0.0, 1.0) * (base.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * frac).round() as u8;
    Rgba([
        mix(base[lo].0[0], base[hi].0[0]),
        mix(base[lo].0[1], base[hi].0[1]),
        mix(base[lo].0[2], base[hi].0[2]),
        255,
    ])
}

pub fn hex_to_rgba(hex: &str) -> FillResult<Rgba<u8>> {
    let digits = hex.trim_start_matches('#');
    let channel = |range: std::ops::Range<usize>| {
        digits
            .get(range)
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| FillError::InvalidParameter(format!("invalid hex color '{}'", hex)))
    };
    if digits.len() != 6 {
        return Err(FillError::InvalidParameter(format!("invalid hex color '{}'", hex)));
    }
    Ok(Rgba([channel(0..2)?, channel(2..4)?, channel(4..6)?, 255]))
}

fn rgba_to_hex(color: Rgba<u8>) -> String {
    format!("#{:02x}{:02x}{:02x}", color.0[0], color.0[1], color.0[2])
}

/// Expands `{name}` placeholders with the unit's attribute values.
///
/// `{id}` is the unit id. Null values print as `n/a`; names the unit does
/// not carry are left as written.
pub fn format_label(template: &str, unit: &SpatialUnit) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if name == "id" {
                    out.push_str(&unit.id);
                } else if let Some(value) = unit.attributes.get(name) {
                    out.push_str(&value.to_string());
                } else {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

struct Styled {
    bin: Option<usize>,
    fill: Rgba<u8>,
    label: String,
}

pub fn render(dataset: &UnitCollection, config: &RenderConfig, out_dir: &Path) -> Result<RenderSummary> {
    info!(
        "Rendering '{}' for {} units with {} {} bins",
        config.attribute,
        dataset.len(),
        config.bins,
        config.palette
    );

    let values: Vec<Option<f64>> = dataset
        .iter()
        .map(|u| u.attr(&config.attribute).as_f64())
        .collect();
    let defined: Vec<f64> = values.iter().flatten().copied().collect();

    let scale = match config.binning {
        Binning::EqualInterval => BinScale::equal_interval(&defined, config.bins),
        Binning::Quantile => BinScale::quantile(&defined, config.bins),
    }
    .with_context(|| format!("Cannot bin attribute '{}'", config.attribute))?;
    let palette = Palette::named(&config.palette, config.bins)?;
    let nan_fill = hex_to_rgba(&config.nan_color)?;

    let styled: Vec<Styled> = dataset
        .iter()
        .zip(&values)
        .map(|(unit, value)| {
            let bin = value.map(|v| scale.bin_of(v));
            Styled {
                bin,
                fill: bin.map(|b| palette.color(b)).unwrap_or(nan_fill),
                label: format_label(&config.label, unit),
            }
        })
        .collect();

    let mut counts = vec![0; scale.bins()];
    for bin in styled.iter().filter_map(|s| s.bin) {
        counts[bin] += 1;
    }
    let undefined = styled.iter().filter(|s| s.bin.is_none()).count();
    if undefined > 0 {
        warn!("{} units have no '{}' value and use the missing-value color", undefined, config.attribute);
    }

    fs::create_dir_all(out_dir).with_context(|| format!("Failed to create output directory {:?}", out_dir))?;

    let geojson = to_geojson(dataset, &styled);
    let geojson_path = out_dir.join("choropleth.geojson");
    fs::write(&geojson_path, geojson.to_string())
        .with_context(|| format!("Failed to write {:?}", geojson_path))?;

    let html_path = out_dir.join("choropleth.html");
    fs::write(&html_path, to_html(&geojson.to_string(), config, &scale, &palette, nan_fill))
        .with_context(|| format!("Failed to write {:?}", html_path))?;

    let png_path = out_dir.join("choropleth.png");
    rasterize(dataset, &styled, config.png_width)
        .save(&png_path)
        .with_context(|| format!("Failed to save {:?}", png_path))?;

    info!("Wrote {:?}, {:?} and {:?}", geojson_path, html_path, png_path);

    Ok(RenderSummary {
        geojson: geojson_path,
        html: html_path,
        png: png_path,
        edges: scale.edges().to_vec(),
        counts,
        undefined,
    })
}

fn to_geojson(dataset: &UnitCollection, styled: &[Styled]) -> geojson::GeoJson {
    let features = dataset
        .iter()
        .zip(styled)
        .map(|(unit, style)| {
            let mut feature = geojson::Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&unit.geometry))),
                id: Some(geojson::feature::Id::String(unit.id.clone())),
                properties: None,
                foreign_members: None,
            };
            for (name, value) in &unit.attributes {
                feature.set_property(name.clone(), value.to_json());
            }
            feature.set_property("fill", rgba_to_hex(style.fill));
            feature.set_property("bin", style.bin);
            feature.set_property("label", style.label.clone());
            feature
        })
        .collect::<geojson::FeatureCollection>();
    geojson::GeoJson::from(features)
}

fn to_html(geojson: &str, config: &RenderConfig, scale: &BinScale, palette: &Palette, nan_fill: Rgba<u8>) -> String {
    let mut legend = String::new();
    for (i, pair) in scale.edges().windows(2).enumerate() {
        legend.push_str(&format!(
            "<div><i style=\"background:{}\"></i>{:.2} &ndash; {:.2}</div>",
            rgba_to_hex(palette.color(i)),
            pair[0],
            pair[1]
        ));
    }
    legend.push_str(&format!(
        "<div><i style=\"background:{}\"></i>no data</div>",
        rgba_to_hex(nan_fill)
    ));

    let title_js = script_safe(&serde_json::Value::String(config.attribute.clone()).to_string());

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css">
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<style>
html, body, #map {{ height: 100%; margin: 0; }}
.legend {{ background: white; padding: 6px 8px; font: 12px sans-serif; }}
.legend i {{ display: inline-block; width: 14px; height: 14px; margin-right: 6px; opacity: 0.8; }}
</style>
</head>
<body>
<div id="map"></div>
<script>
const data = {geojson};
const map = L.map('map');
L.tileLayer('https://tile.openstreetmap.org/{{z}}/{{x}}/{{y}}.png', {{
  attribution: '&copy; OpenStreetMap contributors'
}}).addTo(map);
const layer = L.geoJSON(data, {{
  style: f => ({{ fillColor: f.properties.fill, fillOpacity: 0.7, color: '#555', weight: 0.5 }}),
  onEachFeature: (f, l) => l.bindTooltip(() => {{
    const span = document.createElement('span');
    span.textContent = f.properties.label;
    return span;
  }})
}}).addTo(map);
map.fitBounds(layer.getBounds());
const legend = L.control({{ position: 'bottomright' }});
legend.onAdd = () => {{
  const div = L.DomUtil.create('div', 'legend');
  div.innerHTML = '{legend}';
  const title = document.createElement('b');
  title.textContent = {title_js};
  div.prepend(title);
  return div;
}};
legend.addTo(map);
</script>
</body>
</html>
"#,
        title = escape_html(&config.attribute),
        title_js = title_js,
        geojson = script_safe(geojson),
        legend = legend,
    )
}

/// Keeps JSON embedded in a `<script>` block from closing it.
fn script_safe(json: &str) -> String {
    json.replace("</", "<\\/")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Static preview: each unit's bounding box is scanned pixel by pixel with a
/// point-in-polygon test, in parallel, then painted in dataset order.
fn rasterize(dataset: &UnitCollection, styled: &[Styled], width: u32) -> RgbaImage {
    let extent = dataset
        .iter()
        .filter_map(|u| u.geometry.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                geo::Coord {
                    x: a.min().x.min(b.min().x),
                    y: a.min().y.min(b.min().y),
                },
                geo::Coord {
                    x: a.max().x.max(b.max().x),
                    y: a.max().y.max(b.max().y),
                },
            )
        });
    let extent = match extent {
        Some(r) if r.width() > 0.0 && r.height() > 0.0 => r,
        _ => return ImageBuffer::new(width, 1),
    };

    // Fit the extent inside a width x width box.
    let scale = width as f64 / extent.width().max(extent.height());
    let img_width = ((extent.width() * scale).ceil() as u32).clamp(1, width);
    let height = ((extent.height() * scale).ceil() as u32).clamp(1, width);

    let covered: Vec<Vec<(u32, u32)>> = dataset
        .units()
        .par_iter()
        .map(|unit| {
            let bbox = match unit.geometry.bounding_rect() {
                Some(b) => b,
                None => return Vec::new(),
            };
            let x0 = ((bbox.min().x - extent.min().x) * scale).floor().max(0.0) as u32;
            let x1 = (((bbox.max().x - extent.min().x) * scale).ceil() as u32).min(img_width);
            let y0 = ((extent.max().y - bbox.max().y) * scale).floor().max(0.0) as u32;
            let y1 = (((extent.max().y - bbox.min().y) * scale).ceil() as u32).min(height);

            let mut pixels = Vec::new();
            for py in y0..y1 {
                for px in x0..x1 {
                    let pt = Point::new(
                        extent.min().x + (px as f64 + 0.5) / scale,
                        extent.max().y - (py as f64 + 0.5) / scale,
                    );
                    if unit.geometry.contains(&pt) {
                        pixels.push((px, py));
                    }
                }
            }
            pixels
        })
        .collect();

    let mut img: RgbaImage = ImageBuffer::new(img_width, height);
    for (pixels, style) in covered.iter().zip(styled) {
        for &(px, py) in pixels {
            img.put_pixel(px, py, style.fill);
        }
    }
    img
}
