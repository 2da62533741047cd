use anyhow::{Context, Result};
use ndarray_rand::rand::{Rng, SeedableRng, rngs::StdRng, thread_rng};
use std::time::Instant;
use tracing::{info, warn};

use crate::{
    config::Config,
    digits::{Dataset, FEATURES},
    evaluator::{Evaluation, EvaluationError, evaluate},
    network::Network,
    plot::{self, DigitPlot, PlotError},
    topology::WiringPlan,
    trainer::{Trainer, TrainingReport, TruncatedNewton},
};

#[derive(Debug)]
pub struct Outcome {
    pub training: TrainingReport,
    pub evaluation: Evaluation,
}

// Load both datasets, wire and train the network on the training prefix, score it on the held-out
// set and finally draw one held-out sample. Any error aborts the run before results are printed.
pub fn run(config: &Config) -> Result<Outcome> {
    println!("LOADING DATA...");
    let start = Instant::now();
    let train =
        Dataset::load(&config.train, FEATURES).context("failed to load the training set")?;
    let test = Dataset::load(&config.test, FEATURES).context("failed to load the test set")?;
    if test.is_empty() {
        return Err(anyhow::Error::new(EvaluationError::EmptyEvaluationSet)
            .context("nothing to test the network on"));
    }
    info!(
        train = train.len(),
        test = test.len(),
        "loaded datasets in {:.2}s",
        start.elapsed().as_secs_f32()
    );

    let graph = WiringPlan::digits()
        .build()
        .context("the digit wiring plan is inconsistent")?;
    info!(
        nodes = graph.node_count(),
        edges = graph.edges().len(),
        "built connection graph"
    );
    let subset = train.prefix(config.train_limit);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut network = Network::new(graph, subset.features.view(), &mut rng)?;

    println!("TRAINING NETWORK...");
    let minimizer = TruncatedNewton::new(config.max_evaluations, config.weight_bound);
    let training = Trainer::new(minimizer, config.train_limit)
        .train(&mut network, &train)
        .context("failed to train the network")?;
    println!(
        "Trained on {} samples: error {:.4} -> {:.4} after {} evaluations and {} iterations in {:.1}s ({})",
        training.samples,
        training.initial_error,
        training.final_error,
        training.evaluations,
        training.iterations,
        training.elapsed.as_secs_f32(),
        training.reason
    );

    println!("TESTING NETWORK...");
    let evaluation = evaluate(&network, &test).context("failed to evaluate the network")?;
    println!(
        "Correct: {} ; Incorrect: {}",
        evaluation.correct, evaluation.incorrect
    );
    println!("Accuracy: {} %", evaluation.accuracy());

    if !config.no_plot {
        show_random_sample(config, &network, &test, &evaluation)?;
    }

    Ok(Outcome {
        training,
        evaluation,
    })
}

// Drawing problems never fail the run: the accuracy has already been reported by now.
fn show_random_sample(
    config: &Config,
    network: &Network,
    test: &Dataset,
    evaluation: &Evaluation,
) -> Result<()> {
    let index = thread_rng().gen_range(0..test.len());
    let outputs = network.output(test.image(index))?;
    let sample = DigitPlot {
        image: test.image(index),
        outputs: outputs.view(),
        label: test.labels[index],
        prediction: evaluation.predictions[index],
        accuracy: evaluation.accuracy(),
    };

    match plot::render(&sample, &config.plot_path) {
        Ok(()) => info!(path = %config.plot_path.display(), sample = index, "plot written"),
        Err(PlotError::Unavailable) => {
            println!("Cannot make plots. Rebuild with --features plot to enable plotting.")
        }
        Err(error) => warn!("{error}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        digits::{DatasetError, tests::arff},
        trainer::StopReason,
    };
    use clap::Parser;
    use ndarray::Array1;
    use ndarray_rand::{RandomExt, rand_distr::Uniform};
    use std::path::Path;

    // Each digit is a bright horizontal bar at its own height on a noisy background.
    fn synthetic_digits(count: usize, rng: &mut StdRng) -> Vec<(Vec<f64>, u8)> {
        (0..count)
            .map(|i| {
                let label = (i % 10) as u8;
                let mut pixels = Array1::random_using(FEATURES, Uniform::new(0.0, 0.3), rng);
                let row = label as usize + 3;
                for column in 2..14 {
                    pixels[row * 16 + column] = 1.0;
                }
                (pixels.to_vec(), label)
            })
            .collect()
    }

    fn write(directory: &Path, name: &str, text: &str) -> String {
        let path = directory.join(name);
        std::fs::write(&path, text).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn end_to_end_run_reports_accuracy() {
        let directory = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let train = arff(FEATURES, &synthetic_digits(1000, &mut rng));
        let train = write(directory.path(), "train.arff", &train);
        let test = arff(FEATURES, &synthetic_digits(200, &mut rng));
        let test = write(directory.path(), "test.arff", &test);
        let plot_path = directory.path().join("digits.svg").to_string_lossy().into_owned();

        let config = Config::parse_from([
            "digit-recognizer",
            "--train",
            train.as_str(),
            "--test",
            test.as_str(),
            "--max-evaluations",
            "1000",
            "--plot-path",
            plot_path.as_str(),
        ]);
        let outcome = run(&config).unwrap();

        assert_eq!(outcome.training.samples, 1000);
        assert!(outcome.training.evaluations <= 1000);
        assert!(outcome.training.final_error < outcome.training.initial_error);
        assert_ne!(outcome.training.reason, StopReason::NothingToFit);

        let accuracy = outcome.evaluation.accuracy();
        assert!((0.0..=100.0).contains(&accuracy));
        assert_eq!(outcome.evaluation.total(), 200);
        // The bars are trivially separable, so training has to beat chance by a wide margin.
        assert!(accuracy > 30.0, "accuracy {accuracy}");
    }

    #[test]
    fn mis_sized_dataset_fails_before_training() {
        let directory = tempfile::tempdir().unwrap();
        let narrow = vec![(vec![0.5; 64], 3u8); 5];
        let train = write(directory.path(), "train.arff", &arff(64, &narrow));
        let test = write(directory.path(), "test.arff", &arff(64, &narrow));

        let config = Config::parse_from([
            "digit-recognizer",
            "--train",
            train.as_str(),
            "--test",
            test.as_str(),
            "--no-plot",
        ]);
        let error = run(&config).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<DatasetError>(),
            Some(DatasetError::FeatureWidth { expected: 256, actual: 64, .. })
        ));
    }

    #[test]
    fn empty_test_set_is_rejected_before_training() {
        let directory = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let train = arff(FEATURES, &synthetic_digits(10, &mut rng));
        let train = write(directory.path(), "train.arff", &train);
        let test = write(directory.path(), "test.arff", &arff(FEATURES, &[]));

        let config = Config::parse_from([
            "digit-recognizer",
            "--train",
            train.as_str(),
            "--test",
            test.as_str(),
            "--no-plot",
        ]);
        let error = run(&config).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<EvaluationError>(),
            Some(EvaluationError::EmptyEvaluationSet)
        ));
    }

    #[test]
    fn plotting_problems_do_not_change_the_result() {
        let directory = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let train = arff(FEATURES, &synthetic_digits(40, &mut rng));
        let train = write(directory.path(), "train.arff", &train);
        let test = arff(FEATURES, &synthetic_digits(20, &mut rng));
        let test = write(directory.path(), "test.arff", &test);
        let arguments = |extra: &[&str]| {
            let mut arguments = vec![
                "digit-recognizer",
                "--train",
                train.as_str(),
                "--test",
                test.as_str(),
                "--max-evaluations",
                "30",
            ];
            arguments.extend_from_slice(extra);
            Config::parse_from(arguments)
        };

        let without_plot = run(&arguments(&["--no-plot"])).unwrap();
        // Either the feature is missing or the path cannot be written; neither may fail the run.
        let unwritable = ["--plot-path", "/nonexistent/directory/digits.svg"];
        let with_plot = run(&arguments(&unwritable)).unwrap();
        assert_eq!(
            without_plot.evaluation.accuracy(),
            with_plot.evaluation.accuracy()
        );
    }
}
