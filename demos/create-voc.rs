use argh::FromArgs;
use phow::*;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

/// Train a visual vocabulary on a class-per-directory image collection.
#[derive(FromArgs)]
struct Opts {
    /// image root, one subdirectory per class
    #[argh(positional)]
    data: String,

    /// where to write the vocabulary, default: vocabs/phow.voc
    #[argh(option, short = 'o', default = "String::from(\"vocabs/phow.voc\")")]
    output: String,

    /// pipeline configuration (JSON); defaults are used when omitted
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// number of classes to use, default: 5
    #[argh(option, short = 'g', default = "5")]
    groups: usize,

    /// images sampled per class, default: 30
    #[argh(option, short = 'n', default = "30")]
    per_group: usize,

    /// sampling seed, default: 0
    #[argh(option, default = "0")]
    seed: u64,
}

fn main() -> PhowResult<()> {
    let opts: Opts = argh::from_env();
    let _ = TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );

    let config = match &opts.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    // Sample images of the first classes
    let dataset = GroupedDataset::from_dir(&opts.data)?.sample_groups(opts.groups);
    let sample = dataset.sample_uniform(opts.per_group, opts.seed);
    println!(
        "Training on {} images of {} classes.",
        sample.len(),
        dataset.classes().count()
    );
    let images = sample
        .iter()
        .map(Record::read)
        .collect::<PhowResult<Vec<_>>>()?;

    // Create vocabulary from their descriptors
    let voc = Pipeline::learn_vocabulary(&config, &images)?;
    println!("\nVocabulary = {:#?}", voc);

    // Save vocab and load it again to check the round trip
    if let Some(dir) = std::path::Path::new(&opts.output).parent() {
        std::fs::create_dir_all(dir)?;
    }
    voc.save(&opts.output)?;
    let loaded_voc = Vocabulary::load(&opts.output)?;
    assert_eq!(voc, loaded_voc);
    Ok(())
}
