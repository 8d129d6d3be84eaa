//! Scatter figures of point clouds, with optional displacement arrows.
//!
//! A [`Figure`] is an in-memory list of layers. Nothing is drawn until
//! [`Figure::render_svg`] or [`Figure::save_svg`] is called, at which point the layers
//! are handed to `plotters`' SVG backend.
//!
//! ```rust
//! use otcyto::plot::{figure_clouds, FigureOptions};
//! use otcyto::PointCloud;
//!
//! let a = PointCloud::sphere(20);
//! let b = a.translated(&[1.0, 1.0, 1.0]);
//! let fig = figure_clouds(a.points(), b.points(), None, &FigureOptions::default()).unwrap();
//! let svg = fig.render_svg().unwrap();
//! assert!(svg.contains("Source") && svg.contains("Target"));
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ndarray::ArrayView2;
use plotters::prelude::{
    ChartBuilder, Circle, IntoDrawingArea, PathElement, RGBAColor, SVGBackend, SeriesLabelPosition,
    BLACK, WHITE,
};
use plotters::style::Color as _;
use tracing::{debug, instrument};

use crate::{Error, Result};

/// An sRGB color with alpha, written `#RRGGBB` or `#RRGGBBAA`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    /// Red.
    pub r: u8,
    /// Green.
    pub g: u8,
    /// Blue.
    pub b: u8,
    /// Opacity in `[0, 1]`.
    pub alpha: f64,
}

impl Color {
    /// An opaque color.
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, alpha: 1.0 }
    }

    /// Parse `#RRGGBB` or `#RRGGBBAA` (the leading `#` is optional).
    pub fn from_hex(s: &str) -> Result<Self> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
            return Err(Error::Domain("color must be #RRGGBB or #RRGGBBAA"));
        }
        let byte = |k: usize| {
            u8::from_str_radix(&hex[k..k + 2], 16)
                .map_err(|_| Error::Domain("color must be #RRGGBB or #RRGGBBAA"))
        };
        let alpha = if hex.len() == 8 {
            f64::from(byte(6)?) / 255.0
        } else {
            1.0
        };
        Ok(Self {
            r: byte(0)?,
            g: byte(2)?,
            b: byte(4)?,
            alpha,
        })
    }

    fn to_plotters(self) -> RGBAColor {
        RGBAColor(self.r, self.g, self.b, self.alpha)
    }
}

impl FromStr for Color {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = (self.alpha.clamp(0.0, 1.0) * 255.0).round() as u8;
        write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, a)
    }
}

/// How one cloud is drawn.
#[derive(Debug, Clone)]
pub struct CloudStyle {
    /// Marker color.
    pub color: Color,
    /// Legend entry; `None` leaves the layer out of the legend.
    pub label: Option<String>,
    /// Draw only the first `npoints` rows.
    pub npoints: Option<usize>,
    /// Columns projected onto the horizontal and vertical axes.
    pub axes: (usize, usize),
    /// Marker radius in pixels.
    pub marker_size: u32,
}

impl Default for CloudStyle {
    fn default() -> Self {
        Self {
            color: Color::rgb(0, 0, 0),
            label: None,
            npoints: None,
            axes: (0, 1),
            marker_size: 3,
        }
    }
}

impl CloudStyle {
    /// Default style in the given color.
    pub fn new(color: Color) -> Self {
        Self {
            color,
            ..Self::default()
        }
    }

    /// Set the legend label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Cap the number of drawn points.
    pub fn with_npoints(mut self, npoints: usize) -> Self {
        self.npoints = Some(npoints);
        self
    }

    /// Choose the projected columns.
    pub fn with_axes(mut self, x: usize, y: usize) -> Self {
        self.axes = (x, y);
        self
    }

    /// Set the marker radius.
    pub fn with_marker_size(mut self, marker_size: u32) -> Self {
        self.marker_size = marker_size;
        self
    }
}

type Point = (f64, f64);

#[derive(Debug, Clone)]
enum Layer {
    Scatter {
        points: Vec<Point>,
        color: Color,
        label: Option<String>,
        marker_size: u32,
    },
    Arrows {
        segments: Vec<(Point, Point)>,
        color: Color,
    },
}

/// An in-memory scatter figure.
#[derive(Debug, Clone)]
pub struct Figure {
    width: u32,
    height: u32,
    layers: Vec<Layer>,
}

impl Default for Figure {
    fn default() -> Self {
        Self::new(1200, 1200)
    }
}

impl Figure {
    /// An empty figure of `width × height` pixels.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            layers: Vec::new(),
        }
    }

    /// Pixel size.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Number of scatter layers.
    pub fn scatter_count(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| matches!(l, Layer::Scatter { .. }))
            .count()
    }

    /// Total number of arrows over all arrow layers.
    pub fn arrow_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| match l {
                Layer::Arrows { segments, .. } => segments.len(),
                Layer::Scatter { .. } => 0,
            })
            .sum()
    }

    /// Legend labels in drawing order.
    pub fn labels(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter_map(|l| match l {
                Layer::Scatter { label, .. } => label.as_deref(),
                Layer::Arrows { .. } => None,
            })
            .collect()
    }

    /// Layers in paint order: every scatter, then every arrow layer.
    fn drawing_order(&self) -> impl Iterator<Item = &Layer> {
        let scatters = self.layers.iter().filter(|l| matches!(l, Layer::Scatter { .. }));
        let arrows = self.layers.iter().filter(|l| matches!(l, Layer::Arrows { .. }));
        scatters.chain(arrows)
    }

    /// Square data window around everything drawn, so both axes share one scale.
    fn window(&self) -> (std::ops::Range<f64>, std::ops::Range<f64>) {
        let mut lo = (f64::INFINITY, f64::INFINITY);
        let mut hi = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        let mut see = |(x, y): Point| {
            if x.is_finite() && y.is_finite() {
                lo = (lo.0.min(x), lo.1.min(y));
                hi = (hi.0.max(x), hi.1.max(y));
            }
        };
        for layer in &self.layers {
            match layer {
                Layer::Scatter { points, .. } => points.iter().copied().for_each(&mut see),
                Layer::Arrows { segments, .. } => segments.iter().for_each(|&(a, b)| {
                    see(a);
                    see(b);
                }),
            }
        }
        if !lo.0.is_finite() {
            return (0.0..1.0, 0.0..1.0);
        }
        let half = ((hi.0 - lo.0).max(hi.1 - lo.1) * 0.55).max(0.5);
        let cx = (lo.0 + hi.0) / 2.0;
        let cy = (lo.1 + hi.1) / 2.0;
        (cx - half..cx + half, cy - half..cy + half)
    }

    /// Draw the figure as an SVG document.
    pub fn render_svg(&self) -> Result<String> {
        let mut svg = String::new();
        {
            let root =
                SVGBackend::with_string(&mut svg, (self.width, self.height)).into_drawing_area();
            root.fill(&WHITE).map_err(render_err)?;
            let (xr, yr) = self.window();
            let mut chart = ChartBuilder::on(&root)
                .margin(20)
                .x_label_area_size(40)
                .y_label_area_size(40)
                .build_cartesian_2d(xr, yr)
                .map_err(render_err)?;
            chart.configure_mesh().draw().map_err(render_err)?;

            let mut labelled = false;
            for layer in self.drawing_order() {
                match layer {
                    Layer::Scatter {
                        points,
                        color,
                        label,
                        marker_size,
                    } => {
                        let style = color.to_plotters().filled();
                        let size = *marker_size;
                        let anno = chart
                            .draw_series(points.iter().map(|&p| Circle::new(p, size, style)))
                            .map_err(render_err)?;
                        if let Some(label) = label {
                            labelled = true;
                            anno.label(label.as_str())
                                .legend(move |(x, y)| Circle::new((x, y), 5, style));
                        }
                    }
                    Layer::Arrows { segments, color } => {
                        let stroke = color.to_plotters().stroke_width(1);
                        chart
                            .draw_series(
                                segments
                                    .iter()
                                    .map(|&(a, b)| PathElement::new(vec![a, b], stroke)),
                            )
                            .map_err(render_err)?;
                        chart
                            .draw_series(
                                segments
                                    .iter()
                                    .filter_map(|&(a, b)| arrow_head(a, b))
                                    .map(|head| PathElement::new(head, stroke)),
                            )
                            .map_err(render_err)?;
                    }
                }
            }

            if labelled {
                chart
                    .configure_series_labels()
                    .position(SeriesLabelPosition::UpperLeft)
                    .background_style(WHITE.mix(0.8))
                    .border_style(BLACK)
                    .draw()
                    .map_err(render_err)?;
            }
            root.present().map_err(render_err)?;
        }
        Ok(svg)
    }

    /// Render and write the SVG to `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn save_svg(&self, path: &Path) -> Result<()> {
        let svg = self.render_svg()?;
        std::fs::write(path, svg).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(layers = self.layers.len(), "figure written");
        Ok(())
    }
}

fn render_err<E: fmt::Display>(e: E) -> Error {
    Error::Render(e.to_string())
}

/// Two barbs at the tip of `a → b`, each a fifth of the shaft long, 25° off the shaft.
fn arrow_head(a: Point, b: Point) -> Option<Vec<Point>> {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len = dx.hypot(dy);
    if len == 0.0 || !len.is_finite() {
        return None;
    }
    let back = (-0.2 * dx, -0.2 * dy);
    let (s, c) = 25f64.to_radians().sin_cos();
    let left = (b.0 + back.0 * c - back.1 * s, b.1 + back.0 * s + back.1 * c);
    let right = (b.0 + back.0 * c + back.1 * s, b.1 - back.0 * s + back.1 * c);
    Some(vec![left, b, right])
}

fn check_axes(axes: (usize, usize), dim: usize) -> Result<()> {
    for axis in [axes.0, axes.1] {
        if axis >= dim {
            return Err(Error::AxisOutOfRange { axis, dim });
        }
    }
    Ok(())
}

fn rows_drawn(n: usize, npoints: Option<usize>) -> usize {
    npoints.map_or(n, |cap| cap.min(n))
}

/// Add one scatter layer of `points` projected onto `style.axes`.
pub fn display_cloud(
    fig: &mut Figure,
    points: ArrayView2<'_, f32>,
    style: &CloudStyle,
) -> Result<()> {
    display_cloud_mapping(fig, points, None, style, Color::rgb(0, 0, 0))
}

/// Like [`display_cloud`], plus one arrow `p → p + v` per drawn point when a
/// displacement is given.
///
/// The displacement must have the shape of `points`; it is truncated to the same rows.
pub fn display_cloud_mapping(
    fig: &mut Figure,
    points: ArrayView2<'_, f32>,
    displacement: Option<ArrayView2<'_, f32>>,
    style: &CloudStyle,
    arrow_color: Color,
) -> Result<()> {
    let (n, d) = points.dim();
    check_axes(style.axes, d)?;
    if let Some(v) = &displacement {
        if v.dim() != (n, d) {
            return Err(Error::ShapeMismatch(n, d, v.nrows(), v.ncols()));
        }
    }

    let (ax, ay) = style.axes;
    let take = rows_drawn(n, style.npoints);
    let projected: Vec<Point> = (0..take)
        .map(|i| (f64::from(points[[i, ax]]), f64::from(points[[i, ay]])))
        .collect();

    if let Some(v) = displacement {
        let segments = projected
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| ((x, y), (x + f64::from(v[[i, ax]]), y + f64::from(v[[i, ay]]))))
            .collect();
        fig.layers.push(Layer::Arrows {
            segments,
            color: arrow_color,
        });
    }

    fig.layers.push(Layer::Scatter {
        points: projected,
        color: style.color,
        label: style.label.clone(),
        marker_size: style.marker_size,
    });
    Ok(())
}

/// Settings for [`figure_clouds`].
#[derive(Debug, Clone)]
pub struct FigureOptions {
    /// Source marker color (default `#0000ffa0`).
    pub source_color: Color,
    /// Target marker color (default `#ff0000a0`).
    pub target_color: Color,
    /// Source legend label.
    pub source_label: String,
    /// Target legend label.
    pub target_label: String,
    /// Displacement arrow color (default `#5BBF3AAA`).
    pub arrow_color: Color,
    /// Projected columns.
    pub axes: (usize, usize),
    /// Per-cloud point cap.
    pub npoints: Option<usize>,
    /// Pixel size.
    pub size: (u32, u32),
}

impl Default for FigureOptions {
    fn default() -> Self {
        Self {
            source_color: Color {
                r: 0x00,
                g: 0x00,
                b: 0xff,
                alpha: f64::from(0xa0u8) / 255.0,
            },
            target_color: Color {
                r: 0xff,
                g: 0x00,
                b: 0x00,
                alpha: f64::from(0xa0u8) / 255.0,
            },
            source_label: "Source".to_string(),
            target_label: "Target".to_string(),
            arrow_color: Color {
                r: 0x5b,
                g: 0xbf,
                b: 0x3a,
                alpha: f64::from(0xaau8) / 255.0,
            },
            axes: (0, 1),
            npoints: Some(1000),
            size: (1200, 1200),
        }
    }
}

impl FigureOptions {
    /// Set the projected columns.
    pub fn with_axes(mut self, x: usize, y: usize) -> Self {
        self.axes = (x, y);
        self
    }

    /// Set the per-cloud point cap (`None` draws everything).
    pub fn with_npoints(mut self, npoints: Option<usize>) -> Self {
        self.npoints = npoints;
        self
    }

    /// Set the arrow color.
    pub fn with_arrow_color(mut self, color: Color) -> Self {
        self.arrow_color = color;
        self
    }

    /// Set both marker colors.
    pub fn with_colors(mut self, source: Color, target: Color) -> Self {
        self.source_color = source;
        self.target_color = target;
        self
    }

    /// Set both legend labels.
    pub fn with_labels(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_label = source.into();
        self.target_label = target.into();
        self
    }

    /// Set the pixel size.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    fn style(&self, color: Color, label: &str) -> CloudStyle {
        CloudStyle {
            color,
            label: Some(label.to_string()),
            npoints: self.npoints,
            axes: self.axes,
            ..CloudStyle::default()
        }
    }
}

/// Source and target on one figure, optionally with the source's displacement arrows.
pub fn figure_clouds(
    source: ArrayView2<'_, f32>,
    target: ArrayView2<'_, f32>,
    displacement: Option<ArrayView2<'_, f32>>,
    options: &FigureOptions,
) -> Result<Figure> {
    let mut fig = Figure::new(options.size.0, options.size.1);
    display_cloud_mapping(
        &mut fig,
        source,
        displacement,
        &options.style(options.source_color, &options.source_label),
        options.arrow_color,
    )?;
    display_cloud(
        &mut fig,
        target,
        &options.style(options.target_color, &options.target_label),
    )?;
    Ok(fig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn parses_hex_with_alpha() {
        let c: Color = "#5BBF3AAA".parse().unwrap();
        assert_eq!((c.r, c.g, c.b), (0x5b, 0xbf, 0x3a));
        assert!((c.alpha - 170.0 / 255.0).abs() < 1e-12);
        assert_eq!(c.to_string(), "#5bbf3aaa");
    }

    #[test]
    fn parses_hex_without_alpha() {
        let c = Color::from_hex("ff0000").unwrap();
        assert_eq!(c, Color::rgb(255, 0, 0));
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(Color::from_hex("#12345").is_err());
        assert!(Color::from_hex("#gg0000").is_err());
    }

    #[test]
    fn default_options_match_documented_colors() {
        let o = FigureOptions::default();
        assert_eq!(o.source_color, Color::from_hex("#0000ffa0").unwrap());
        assert_eq!(o.target_color, Color::from_hex("#ff0000a0").unwrap());
        assert_eq!(o.arrow_color, Color::from_hex("#5BBF3AAA").unwrap());
        assert_eq!(o.npoints, Some(1000));
        assert_eq!(o.axes, (0, 1));
    }

    #[test]
    fn npoints_truncates_points_and_arrows() {
        let pts = Array2::<f32>::zeros((10, 2));
        let v = Array2::<f32>::ones((10, 2));
        let mut fig = Figure::default();
        let style = CloudStyle::new(Color::rgb(0, 0, 255)).with_npoints(4);
        let green = Color::rgb(0, 255, 0);
        display_cloud_mapping(&mut fig, pts.view(), Some(v.view()), &style, green).unwrap();
        assert_eq!(fig.arrow_count(), 4);
        assert_eq!(fig.scatter_count(), 1);
    }

    #[test]
    fn axis_out_of_range() {
        let pts = array![[0.0f32, 1.0]];
        let mut fig = Figure::default();
        let style = CloudStyle::default().with_axes(0, 2);
        let err = display_cloud(&mut fig, pts.view(), &style).unwrap_err();
        assert!(matches!(err, Error::AxisOutOfRange { axis: 2, dim: 2 }));
    }

    #[test]
    fn displacement_shape_must_match() {
        let pts = Array2::<f32>::zeros((3, 2));
        let v = Array2::<f32>::zeros((2, 2));
        let mut fig = Figure::default();
        let style = CloudStyle::default();
        let black = Color::rgb(0, 0, 0);
        let err =
            display_cloud_mapping(&mut fig, pts.view(), Some(v.view()), &style, black).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(3, 2, 2, 2)));
    }

    #[test]
    fn figure_has_two_labelled_clouds() {
        let a = array![[0.0f32, 0.0], [1.0, 0.0]];
        let b = array![[0.0f32, 1.0], [1.0, 1.0]];
        let fig = figure_clouds(a.view(), b.view(), None, &FigureOptions::default()).unwrap();
        assert_eq!(fig.labels(), vec!["Source", "Target"]);
        assert_eq!(fig.arrow_count(), 0);
        assert_eq!(fig.size(), (1200, 1200));
    }

    #[test]
    fn arrows_are_drawn_above_both_clouds() {
        let a = array![[0.0f32, 0.0], [1.0, 0.5]];
        let v = array![[0.5f32, 0.5], [0.5, 0.5]];
        let b = &a + &v;
        let options = FigureOptions::default();
        let fig = figure_clouds(a.view(), b.view(), Some(v.view()), &options).unwrap();
        let order: Vec<bool> = fig
            .drawing_order()
            .map(|l| matches!(l, Layer::Arrows { .. }))
            .collect();
        assert_eq!(order, vec![false, false, true]);
    }

    #[test]
    fn arrow_head_ends_at_tip() {
        let head = arrow_head((0.0, 0.0), (1.0, 0.0)).unwrap();
        assert_eq!(head[1], (1.0, 0.0));
        assert!(head[0].0 < 1.0 && head[2].0 < 1.0);
        assert!(arrow_head((1.0, 1.0), (1.0, 1.0)).is_none());
    }

    #[test]
    fn renders_svg_with_legend() {
        let a = array![[0.0f32, 0.0], [1.0, 0.5]];
        let v = array![[0.5f32, 0.5], [0.5, 0.5]];
        let b = &a + &v;
        let options = FigureOptions::default();
        let fig = figure_clouds(a.view(), b.view(), Some(v.view()), &options).unwrap();
        let svg = fig.render_svg().unwrap();
        assert!(svg.starts_with("<svg") || svg.starts_with("<?xml"));
        assert!(svg.contains("Source"));
        assert!(svg.contains("Target"));
    }
}
