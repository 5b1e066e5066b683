use argh::FromArgs;
use phow::*;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

/// Train and evaluate a PHOW classifier on a class-per-directory image collection.
#[derive(FromArgs)]
struct Opts {
    /// image root, one subdirectory per class
    #[argh(positional)]
    data: String,

    /// vocabulary created by the create-voc demo, default: vocabs/phow.voc
    #[argh(option, short = 'v', default = "String::from(\"vocabs/phow.voc\")")]
    vocabulary: String,

    /// pipeline configuration (JSON); defaults are used when omitted
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// number of classes to use, default: 5
    #[argh(option, short = 'g', default = "5")]
    groups: usize,

    /// training images per class, default: 15
    #[argh(option, default = "15")]
    train: usize,

    /// test images per class, default: 15
    #[argh(option, default = "15")]
    test: usize,

    /// split seed, default: 0
    #[argh(option, default = "0")]
    seed: u64,

    /// directory for cached feature vectors
    #[argh(option)]
    cache: Option<String>,

    /// report a class as unknown when its score leads by less than this
    #[argh(option)]
    margin: Option<f64>,

    /// write the trained model here
    #[argh(option, short = 'o')]
    output: Option<String>,

    /// log per-image progress
    #[argh(switch)]
    verbose: bool,
}

fn main() -> PhowResult<()> {
    let opts: Opts = argh::from_env();
    let level = if opts.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = TermLogger::init(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto);

    let mut config = match &opts.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &opts.cache {
        config.cache = Some(CacheConfig {
            store_location: dir.into(),
            namespace_key: "phow".to_string(),
        });
    }

    let voc = Vocabulary::load(&opts.vocabulary)?;
    println!("Vocabulary: {:?}", voc);
    let pipeline = Pipeline::new(config, voc)?;

    let dataset = GroupedDataset::from_dir(&opts.data)?.sample_groups(opts.groups);
    let (train, test) = dataset.split(opts.train, opts.test, opts.seed);
    let train: Vec<Record> = train.records().cloned().collect();
    let test: Vec<Record> = test.records().cloned().collect();
    println!(
        "{} training and {} test images, feature length {}",
        train.len(),
        test.len(),
        pipeline.feature_len()
    );

    let classifier = pipeline.train_classifier(&train)?;
    if let Some(path) = &opts.output {
        classifier.model()?.save(path)?;
    }

    let report = match opts.margin {
        Some(margin) => pipeline.evaluate(&classifier, &test, MarginThreshold { margin })?,
        None => pipeline.evaluate(&classifier, &test, NeverAbstain)?,
    };
    println!("\n{}", report);

    if let Some(cache) = pipeline.cache() {
        let stats = cache.stats();
        println!(
            "\nCache: {} hits, {} misses, {} corrupt",
            stats.hits, stats.misses, stats.corrupt
        );
    }
    Ok(())
}
