use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use storycraft::{
    plot_images, write_strings_to_file, Cli, OutputLayout, SegmentationMode, StoryPipeline,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let layout = create_output_directory(&cli.output_directory)?;

    println!("-------StoryCraft-------");
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let prompt = ask(&mut input, "Enter a prompt describing your character and context: ")?;
    let segm_type = ask(&mut input, "Enter 1 for hair change or 2 for character change: ")?;
    let prompt_inpaint = ask(&mut input, "Describe either your new character or hair style: ")?;

    let mode = SegmentationMode::from_selector(&segm_type);
    let pipeline = StoryPipeline::with_onnx_models(cli.pipeline_config(), mode)
        .context("Failed to prepare the models")?;
    pipeline
        .run(&prompt, &prompt_inpaint, &layout)
        .context("Pipeline run failed")?;

    write_strings_to_file(&prompt, &prompt_inpaint, &layout.prompt())?;
    plot_images(layout.root(), cli.font.as_deref())?;

    Ok(())
}

fn create_output_directory(path: &Path) -> Result<OutputLayout> {
    let existed = path.exists();
    let layout = OutputLayout::create(path)
        .context("An error occurred while creating the directory")?;
    if !existed {
        println!("Directory '{}' created successfully", path.display());
    }
    Ok(layout)
}

fn ask(input: &mut impl BufRead, question: &str) -> Result<String> {
    print!("{}", question);
    io::stdout().flush()?;

    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("Failed to read from standard input")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
