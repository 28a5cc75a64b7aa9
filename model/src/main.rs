use std::path::PathBuf;

use capsnet::{LossConfig, Mode, ModelBuilder, NetworkConfig};
use clap::Parser;
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CapsNet - passe avant sur un batch synthétique
#[derive(Parser, Debug)]
#[command(name = "capsnet", author, version, about, long_about = None)]
struct Cli {
    /// Configuration réseau JSON (réseau MNIST par défaut)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Nombre d'images du batch synthétique
    #[arg(short, long, default_value_t = 4)]
    batch: usize,

    /// Graine des poids et des données
    #[arg(short, long)]
    seed: Option<u64>,

    /// Affiche la configuration JSON et quitte
    #[arg(long)]
    dump_config: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let network_config = match &cli.config {
        Some(path) => NetworkConfig::from_json_file(path)?,
        None => NetworkConfig::default(),
    };

    if cli.dump_config {
        println!("{}", network_config.to_json_string()?);
        return Ok(());
    }

    info!("🚀 CAPSNET - CLASSIFICATION DE CHIFFRES");

    // Construction du modèle
    let mut builder = ModelBuilder::new()
        .with_network_config(network_config)
        .with_loss_config(LossConfig::default());
    if let Some(seed) = cli.seed {
        builder = builder.with_seed(seed);
    }
    let model = builder.build()?;
    model.summary();

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let images = Array2::random_using(
        (cli.batch, model.network_config.image_pixels()),
        Uniform::new(0.0f32, 1.0),
        &mut rng,
    );
    let labels: Vec<usize> = (0..cli.batch)
        .map(|_| rng.gen_range(0..model.network_config.num_classes()))
        .collect();

    // Prédiction
    let prediction = model.forward(&images.view(), Mode::Predict, None)?;
    for (b, &class) in prediction.predicted_class.iter().enumerate() {
        info!(
            "   Image {}: classe {} (longueur {:.4}, probabilité {:.4})",
            b,
            class,
            prediction.lengths[[b, class]],
            prediction.probabilities[[b, class]]
        );
    }

    // Évaluation contre des étiquettes aléatoires
    let evaluation = model.forward(&images.view(), Mode::Eval, Some(&labels))?;
    if let Some(loss) = evaluation.loss {
        info!(
            "📊 Perte: {:.4} (margin {:.4}, reconstruction {})",
            loss.total,
            loss.margin,
            loss.reconstruction
                .map_or_else(|| "désactivée".to_string(), |r| format!("{:.6}", r))
        );
    }

    Ok(())
}
