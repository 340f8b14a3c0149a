use super::{ColorStop, DrawCommand, LinearGradient, Point, Rgba};

/// Inset on every edge of the surface
pub const PADDING: f64 = 20.0;

const GRID_DIVISIONS: usize = 4;
const GRID_COLOR: Rgba = Rgba::new(255, 255, 255, 0.1);
const LINE_COLOR: Rgba = Rgba::new(0, 208, 156, 1.0);
const LINE_WIDTH: f64 = 2.0;

/// Render a series onto a `width` x `height` surface
///
/// Values are scaled to the series' own min/max inside the padding. A flat
/// series uses a range of 1 so it sits on the baseline. A single point is
/// drawn at the horizontal center. Non-finite values are dropped.
pub fn render(series: &[f64], width: f64, height: f64) -> Vec<DrawCommand> {
    let mut commands = vec![DrawCommand::Clear { width, height }];
    commands.extend(grid_lines(width, height));

    let values: Vec<f64> = series.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return commands;
    }

    let points = plot_points(&values, width, height);
    let baseline = height - PADDING;

    let mut area = Vec::with_capacity(points.len() + 2);
    area.push(Point {
        x: PADDING,
        y: baseline,
    });
    area.extend(points.iter().copied());
    area.push(Point {
        x: width - PADDING,
        y: baseline,
    });

    commands.push(DrawCommand::Polyline {
        points,
        color: LINE_COLOR,
        line_width: LINE_WIDTH,
    });
    commands.push(DrawCommand::FillArea {
        points: area,
        gradient: area_gradient(height),
    });

    commands
}

fn grid_lines(width: f64, height: f64) -> impl Iterator<Item = DrawCommand> {
    let plot_width = width - 2.0 * PADDING;

    (0..=GRID_DIVISIONS).map(move |i| {
        let x = PADDING + plot_width * (i as f64 / GRID_DIVISIONS as f64);
        DrawCommand::GridLine {
            from: Point { x, y: PADDING },
            to: Point {
                x,
                y: height - PADDING,
            },
            color: GRID_COLOR,
            line_width: 1.0,
        }
    })
}

fn plot_points(values: &[f64], width: f64, height: f64) -> Vec<Point> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let range = if max - min == 0.0 { 1.0 } else { max - min };
    let y_scale = (height - 2.0 * PADDING) / range;
    let y_of = |v: f64| height - PADDING - (v - min) * y_scale;

    if values.len() == 1 {
        return vec![Point {
            x: width / 2.0,
            y: y_of(values[0]),
        }];
    }

    let x_step = (width - 2.0 * PADDING) / (values.len() - 1) as f64;
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| Point {
            x: PADDING + i as f64 * x_step,
            y: y_of(v),
        })
        .collect()
}

fn area_gradient(height: f64) -> LinearGradient {
    LinearGradient {
        from: Point { x: 0.0, y: 0.0 },
        to: Point { x: 0.0, y: height },
        stops: vec![
            ColorStop {
                offset: 0.0,
                color: Rgba::new(0, 208, 156, 0.3),
            },
            ColorStop {
                offset: 1.0,
                color: Rgba::new(0, 208, 156, 0.0),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polyline(commands: &[DrawCommand]) -> Vec<Point> {
        commands
            .iter()
            .find_map(|c| match c {
                DrawCommand::Polyline { points, .. } => Some(points.clone()),
                _ => None,
            })
            .expect("polyline")
    }

    #[test]
    fn test_scales_into_padding() {
        let commands = render(&[8500.0, 8600.0, 8450.0, 8550.0, 8700.0], 440.0, 150.0);
        let points = polyline(&commands);

        assert_eq!(points.len(), 5);
        assert_eq!(points[0].x, PADDING);
        assert_eq!(points[4].x, 440.0 - PADDING);

        // Max sits on the top padding, min on the baseline
        assert!((points[4].y - PADDING).abs() < 1e-9);
        assert_eq!(points[2].y, 150.0 - PADDING);
    }

    #[test]
    fn test_constant_series_uses_unit_range() {
        let points = polyline(&render(&[5.0, 5.0, 5.0], 200.0, 100.0));

        assert!(points.iter().all(|p| p.y == 100.0 - PADDING));
        assert!(points.iter().all(|p| p.y.is_finite()));
    }

    #[test]
    fn test_single_point_is_centered() {
        let points = polyline(&render(&[42.0], 300.0, 100.0));
        assert_eq!(points, vec![Point { x: 150.0, y: 80.0 }]);
    }

    #[test]
    fn test_empty_series_draws_grid_only() {
        let commands = render(&[], 300.0, 100.0);

        assert_eq!(commands.len(), 1 + GRID_DIVISIONS + 1);
        assert!(matches!(commands[0], DrawCommand::Clear { .. }));
        assert!(commands[1..]
            .iter()
            .all(|c| matches!(c, DrawCommand::GridLine { .. })));
    }

    #[test]
    fn test_area_closes_on_baseline() {
        let commands = render(&[1.0, 3.0, 2.0], 200.0, 100.0);
        let area = commands
            .iter()
            .find_map(|c| match c {
                DrawCommand::FillArea { points, .. } => Some(points.clone()),
                _ => None,
            })
            .unwrap();

        assert_eq!(area.len(), 5);
        assert_eq!(area[0], Point { x: PADDING, y: 80.0 });
        assert_eq!(area[4], Point { x: 180.0, y: 80.0 });
    }

    #[test]
    fn test_deterministic() {
        let series = [3.5, 1.25, f64::NAN, 9.0];
        assert_eq!(render(&series, 320.0, 180.0), render(&series, 320.0, 180.0));
        assert_eq!(polyline(&render(&series, 320.0, 180.0)).len(), 3);
    }

    #[test]
    fn test_serializes_with_op_tag() {
        let json = serde_json::to_value(render(&[1.0, 2.0], 100.0, 60.0)).unwrap();
        assert_eq!(json[0]["op"], "clear");
        assert_eq!(json[1]["op"], "grid_line");
    }
}
