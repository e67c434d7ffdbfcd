use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use log::info;
use teachable::preview::read_image_dir;
use teachable::{
    BuiltinModel, ClassDefinition, ExtractorOptions, ImageSample, ModelManager, Prediction, PreviewTask,
    PreviewUpdate, ReplayCamera, TeachableMachine, TeachableMachineBuilder,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Default)]
struct ModelArgs {
    /// ONNX model to use instead of the built-in one
    #[arg(short, long)]
    model: Option<PathBuf>,
    /// Output of the custom model that holds the features (default: its first output)
    #[arg(long, requires = "model")]
    model_output: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Download the built-in feature extractor model
    Download {
        /// Force a fresh download of the model file
        #[arg(short, long)]
        fresh: bool,
    },
    /// Train on directories of images and export the dataset
    Train {
        /// A class as LABEL=DIR; repeat for each class
        #[arg(short, long = "class", value_name = "LABEL=DIR", required = true)]
        classes: Vec<String>,
        /// Where to write the exported dataset
        #[arg(short, long)]
        out: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Classify a single image with an exported dataset
    Predict {
        #[arg(short, long)]
        dataset: PathBuf,
        #[arg(short, long)]
        image: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
        /// Neighbours consulted per prediction
        #[arg(short, default_value_t = 3)]
        k: usize,
    },
    /// Replay a directory of frames through the live preview loop
    Preview {
        #[arg(short, long)]
        dataset: PathBuf,
        #[arg(short, long)]
        frames: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
        /// Delay between frames in milliseconds
        #[arg(long, default_value_t = 16)]
        interval_ms: u64,
    },
}

fn parse_class_arg(arg: &str) -> Result<(String, PathBuf)> {
    match arg.split_once('=') {
        Some((label, dir)) if !label.is_empty() && !dir.is_empty() => {
            Ok((label.to_string(), PathBuf::from(dir)))
        }
        _ => bail!("class must look like LABEL=DIR, got '{}'", arg),
    }
}

fn with_extractor(builder: TeachableMachineBuilder, model: ModelArgs) -> Result<TeachableMachineBuilder> {
    let builder = match model.model {
        Some(path) => {
            let options = ExtractorOptions {
                output_name: model.model_output,
                ..ExtractorOptions::default()
            };
            builder.with_custom_model_options(&path.to_string_lossy(), options)?
        }
        None => builder
            .with_model(BuiltinModel::ClipVitB32)
            .context("built-in model unavailable; run `teachable_bin download` first")?,
    };
    Ok(builder)
}

async fn download(fresh: bool) -> Result<()> {
    let manager = ModelManager::new_default()?;
    let model = BuiltinModel::ClipVitB32;
    if fresh {
        info!("Fresh download requested - removing any existing model file...");
        manager.remove_download(model)?;
    }
    let path = manager.ensure_model_downloaded(model).await?;
    println!("Model ready at {}", path.display());
    Ok(())
}

async fn train(classes: Vec<String>, out: PathBuf, model: ModelArgs) -> Result<()> {
    let mut builder = with_extractor(TeachableMachine::builder(), model)?;
    for arg in &classes {
        let (label, dir) = parse_class_arg(arg)?;
        let images = read_image_dir(&dir).with_context(|| format!("reading images for '{}'", label))?;
        info!("Class '{}': {} images from {:?}", label, images.len(), dir);
        builder = builder.add_class(ClassDefinition::new(label).with_images(images))?;
    }
    let machine = builder.build()?;

    let start = Instant::now();
    machine.train().await?;
    info!("Training took {:.2?}", start.elapsed());

    machine.export_to_file(&out)?;
    let info = machine.info();
    println!("Trained {} classes, wrote {}", info.class_labels.len(), out.display());
    for (label, count) in info.example_counts {
        println!("  {}: {} examples", label, count);
    }
    Ok(())
}

async fn predict(dataset: PathBuf, image: PathBuf, model: ModelArgs, k: usize) -> Result<()> {
    let machine = with_extractor(TeachableMachine::builder(), model)?
        .with_k(k)?
        .build()?;
    machine.import_from_file(&dataset)?;

    let sample = ImageSample::from_path(&image)?;
    let prediction = machine.predict(&sample).await?;
    print_prediction(&prediction);
    Ok(())
}

async fn preview(dataset: PathBuf, frames: PathBuf, model: ModelArgs, interval_ms: u64) -> Result<()> {
    let machine = with_extractor(TeachableMachine::builder(), model)?
        .with_frame_interval(Duration::from_millis(interval_ms))
        .build()?;
    machine.import_from_file(&dataset)?;
    let machine = Arc::new(machine);

    let camera = ReplayCamera::from_dir(&frames)?;
    let task = PreviewTask::start(Arc::clone(&machine), &camera)?;
    let mut updates = task.updates();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let update = updates.borrow_and_update().clone();
                match update {
                    PreviewUpdate::Waiting => {}
                    PreviewUpdate::Prediction { frame, prediction } => {
                        println!("frame {}:", frame);
                        print_prediction(&prediction);
                    }
                    PreviewUpdate::Failed { frame, message } => eprintln!("frame {}: {}", frame, message),
                    PreviewUpdate::Ended => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    task.stop().await?;
    Ok(())
}

fn print_prediction(prediction: &Prediction) {
    let mut scores: Vec<_> = prediction.confidences.iter().collect();
    scores.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));

    println!("  Predicted class: {}", prediction.label);
    for (label, score) in scores {
        println!("    {}: {:.1}%", label, score * 100.0);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    teachable::init_logger();
    let args = Args::parse();

    match args.command {
        Command::Download { fresh } => download(fresh).await,
        Command::Train { classes, out, model } => train(classes, out, model).await,
        Command::Predict { dataset, image, model, k } => predict(dataset, image, model, k).await,
        Command::Preview { dataset, frames, model, interval_ms } => {
            preview(dataset, frames, model, interval_ms).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_class_arg() {
        let (label, dir) = parse_class_arg("cat=./images/cat").unwrap();
        assert_eq!(label, "cat");
        assert_eq!(dir, PathBuf::from("./images/cat"));
        assert!(parse_class_arg("cat").is_err());
        assert!(parse_class_arg("=dir").is_err());
    }

    #[test]
    fn test_cli_parses_train() {
        let args = Args::try_parse_from([
            "teachable_bin", "train", "-c", "cat=a", "--class", "dog=b", "--out", "model.json",
        ])
        .unwrap();
        match args.command {
            Command::Train { classes, out, model } => {
                assert_eq!(classes, vec!["cat=a", "dog=b"]);
                assert_eq!(out, PathBuf::from("model.json"));
                assert!(model.model.is_none());
            }
            _ => panic!("expected train"),
        }
    }

    #[test]
    fn test_cli_custom_model_output() {
        let args = Args::try_parse_from([
            "teachable_bin", "predict", "-d", "data.json", "-i", "cat.png", "-m", "vit.onnx",
            "--model-output", "pooler_output",
        ])
        .unwrap();
        match args.command {
            Command::Predict { model, .. } => {
                assert_eq!(model.model, Some(PathBuf::from("vit.onnx")));
                assert_eq!(model.model_output.as_deref(), Some("pooler_output"));
            }
            _ => panic!("expected predict"),
        }

        // an output name means nothing without a custom model
        assert!(Args::try_parse_from([
            "teachable_bin", "predict", "-d", "data.json", "-i", "cat.png", "--model-output", "x",
        ])
        .is_err());
    }
}
