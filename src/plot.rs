use ndarray::ArrayView1;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlotError {
    #[error("plotting support was not compiled in")]
    Unavailable,
    #[error("cannot draw {path}: {message}")]
    Drawing { path: PathBuf, message: String },
}

// One held-out sample: its pixels, the network's ten outputs for it and the accuracy over the
// whole held-out set.
#[derive(Debug, Clone, Copy)]
pub struct DigitPlot<'a> {
    pub image: ArrayView1<'a, f64>,
    pub outputs: ArrayView1<'a, f64>,
    pub label: u8,
    pub prediction: Option<usize>,
    pub accuracy: f64,
}

#[cfg(not(feature = "plot"))]
pub fn render(_plot: &DigitPlot, _path: &Path) -> Result<(), PlotError> {
    Err(PlotError::Unavailable)
}

// Draw the sample as a grey-scale grid on top and a bar per output below it.
#[cfg(feature = "plot")]
pub fn render(plot: &DigitPlot, path: &Path) -> Result<(), PlotError> {
    use crate::digits::IMAGE_SIDE;
    use plotters::prelude::*;

    let failed = |error: &dyn std::fmt::Display| PlotError::Drawing {
        path: path.to_path_buf(),
        message: error.to_string(),
    };

    let root = SVGBackend::new(path, (640, 800)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| failed(&e))?;
    let (upper, lower) = root.split_vertically(400);

    let side = IMAGE_SIDE as i32;
    let mut image = ChartBuilder::on(&upper)
        .caption(
            match plot.prediction {
                Some(digit) => format!("Labelled {}, network guesses {digit}", plot.label),
                None => format!("Labelled {}, network has no guess", plot.label),
            },
            ("sans-serif", 20),
        )
        .margin(10)
        .build_cartesian_2d(0..side, 0..side)
        .map_err(|e| failed(&e))?;

    let (low, high) = plot
        .image
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), &v| {
            (low.min(v), high.max(v))
        });
    image
        .draw_series(plot.image.iter().enumerate().map(|(index, &value)| {
            let (row, column) = ((index / IMAGE_SIDE) as i32, (index % IMAGE_SIDE) as i32);
            let ink = if high > low {
                ((value - low) / (high - low) * 255.0) as u8
            } else {
                0
            };
            let shade = RGBColor(255 - ink, 255 - ink, 255 - ink);
            // Row 0 is the top of the picture.
            Rectangle::new(
                [(column, side - 1 - row), (column + 1, side - row)],
                shade.filled(),
            )
        }))
        .map_err(|e| failed(&e))?;

    let classes = plot.outputs.len() as i32;
    let mut bars = ChartBuilder::on(&lower)
        .caption(format!("Accuracy: {:.2}%", plot.accuracy), ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(35)
        .y_label_area_size(45)
        .build_cartesian_2d((0..classes).into_segmented(), -1.2f64..1.2)
        .map_err(|e| failed(&e))?;
    bars.configure_mesh()
        .disable_x_mesh()
        .x_desc("Digit")
        .y_desc("Network outputs")
        .draw()
        .map_err(|e| failed(&e))?;

    bars.draw_series(plot.outputs.iter().enumerate().map(|(digit, &value)| {
        let digit = digit as i32;
        let mut bar = Rectangle::new(
            [
                (SegmentValue::Exact(digit), 0.0),
                (SegmentValue::Exact(digit + 1), value),
            ],
            BLUE.filled(),
        );
        bar.set_margin(0, 0, 8, 8);
        bar
    }))
    .map_err(|e| failed(&e))?;
    bars.draw_series(LineSeries::new(
        [
            (SegmentValue::Exact(0), 0.0),
            (SegmentValue::Exact(classes), 0.0),
        ],
        &BLACK,
    ))
    .map_err(|e| failed(&e))?;

    root.present().map_err(|e| failed(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digits::{CLASSES, FEATURES};
    use ndarray::Array1;

    #[cfg(not(feature = "plot"))]
    #[test]
    fn reports_unavailable_without_feature() {
        let image = Array1::zeros(FEATURES);
        let outputs = Array1::zeros(CLASSES);
        let plot = DigitPlot {
            image: image.view(),
            outputs: outputs.view(),
            label: 0,
            prediction: None,
            accuracy: 0.0,
        };
        assert!(matches!(
            render(&plot, Path::new("unused.svg")),
            Err(PlotError::Unavailable)
        ));
    }

    #[cfg(feature = "plot")]
    #[test]
    fn writes_svg() {
        let image = Array1::linspace(0.0, 1.0, FEATURES);
        let outputs = Array1::linspace(-1.0, 1.0, CLASSES);
        let plot = DigitPlot {
            image: image.view(),
            outputs: outputs.view(),
            label: 7,
            prediction: Some(7),
            accuracy: 93.5,
        };
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("digit.svg");

        render(&plot, &path).unwrap();
        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("Accuracy: 93.50%"));
        assert!(svg.contains("network guesses 7"));
    }

    #[cfg(feature = "plot")]
    #[test]
    fn unwritable_path_is_a_drawing_error() {
        let image = Array1::zeros(FEATURES);
        let outputs = Array1::zeros(CLASSES);
        let plot = DigitPlot {
            image: image.view(),
            outputs: outputs.view(),
            label: 0,
            prediction: None,
            accuracy: 0.0,
        };
        let result = render(&plot, Path::new("/nonexistent/directory/digit.svg"));
        assert!(matches!(result, Err(PlotError::Drawing { .. })));
    }
}
