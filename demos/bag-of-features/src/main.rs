use argh::FromArgs;
use std::path::PathBuf;

use kornia_bof::{
    Augment, BagOfFeaturesEncoder, BofConfig, BofError, BofModel, CpuAllocator, Image, ImageSize,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[derive(FromArgs)]
/// Fit a bag of features encoder on synthetic textures and compare histograms
struct Args {
    /// number of centroids per level
    #[argh(option, default = "10")]
    n_clusters: usize,

    /// depth of the codebook tree
    #[argh(option, default = "2")]
    levels: usize,

    /// augmentation policy: none, rotate, reflect or both
    #[argh(option, default = "Augment::None")]
    augment: Augment,

    /// seed for reproducible fits
    #[argh(option, default = "42")]
    seed: u64,

    /// where to store the fitted model, a temporary file if omitted
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
}

const SIZE: usize = 48;

type GrayImage = Image<u8, 1, CpuAllocator>;

// vertical stripes or a checkerboard of the given period, plus uniform noise
fn texture(checker: bool, period: usize, rng: &mut StdRng) -> Result<GrayImage, BofError> {
    let mut data = Vec::with_capacity(SIZE * SIZE);
    for y in 0..SIZE {
        for x in 0..SIZE {
            let on = if checker {
                (x / period + y / period) % 2 == 0
            } else {
                (x / period) % 2 == 0
            };
            let base: u8 = if on { 200 } else { 40 };
            data.push(base.saturating_add(rng.random_range(0..30)));
        }
    }
    let size = ImageSize {
        width: SIZE,
        height: SIZE,
    };
    Ok(Image::new(size, data, CpuAllocator)?)
}

fn l1_similarity(a: &[u32], b: &[u32]) -> f32 {
    let (sa, sb) = (
        a.iter().sum::<u32>().max(1) as f32,
        b.iter().sum::<u32>().max(1) as f32,
    );
    let distance: f32 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| (x as f32 / sa - y as f32 / sb).abs())
        .sum();
    1.0 - 0.5 * distance
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    println!("=== kornia-bof Feature Demo ===\n");

    println!("-> Generating textures...");
    let mut rng = StdRng::seed_from_u64(args.seed);
    let corpus: Vec<GrayImage> = (0..20)
        .map(|i| texture(i % 2 == 1, 3 + i % 3, &mut rng))
        .collect::<Result<_, _>>()?;
    let queries = vec![
        texture(false, 4, &mut rng)?,
        texture(false, 4, &mut rng)?,
        texture(true, 4, &mut rng)?,
    ];

    println!("-> Fitting encoder...");
    let config = BofConfig::default()
        .with_n_clusters(args.n_clusters)
        .with_levels(args.levels)
        .with_augment(args.augment)
        .with_seed(args.seed);
    let mut encoder = BagOfFeaturesEncoder::new(config)?;
    let count = corpus.len();
    let leaves = encoder.fit(corpus, count)?.leaf_count();
    log::info!("codebook with {leaves} codewords");

    println!("-> Saving and loading...");
    let tmp = tempfile::tempdir()?;
    let path = args
        .output
        .unwrap_or_else(|| tmp.path().join("bag_of_features.bin"));
    if let Some(model) = encoder.model() {
        model.save(&path)?;
    }
    let loaded = BagOfFeaturesEncoder::from_model(BofModel::load(&path)?);

    println!("-> Computing histograms...");
    let histograms = loaded.predict(&queries, true)?;
    for (name, histogram) in ["stripes a", "stripes b", "checker"]
        .iter()
        .zip(&histograms)
    {
        let used = histogram.iter().filter(|&&c| c > 0).count();
        println!("   {name:<10} {used} of {leaves} codewords used");
    }

    println!("-> Similarity Scores (L1):");
    println!(
        "   stripes vs stripes: {:.4}",
        l1_similarity(&histograms[0], &histograms[1])
    );
    println!(
        "   stripes vs checker: {:.4}",
        l1_similarity(&histograms[0], &histograms[2])
    );

    Ok(())
}
