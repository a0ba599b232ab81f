use clap::{CommandFactory, Parser};
use dlrootfs::{
    cli::{styles::AnsiStyles, DlrootfsArgs},
    layer::{LayerPipeline, PipelineConfig},
    oci::DockerRegistry,
    DlrootfsResult,
};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> DlrootfsResult<()> {
    let args = DlrootfsArgs::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if args.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let Some(image) = args.image else {
        DlrootfsArgs::command().print_help()?;
        return Ok(());
    };

    println!("Retrieving {} ...", image.to_string().literal());

    let with_credentials = args.credentials.is_some();
    let registry = DockerRegistry::new(image.clone(), args.credentials);
    let config = PipelineConfig::builder()
        .rootfs_dir(args.destination)
        .layering(args.layering)
        .changeset_dir(args.export_changesets)
        .prefetch(args.prefetch)
        .keep_repository(!args.discard_snapshots)
        .build();

    let report = LayerPipeline::new(registry, config).run().await?;
    tracing::debug!("applied layers: {:?}", report.get_layers());

    println!(
        "Rootfs of {} in {}",
        format!("{}:{}", image.get_repository(), image.get_tag()).valid(),
        report.get_rootfs().display().to_string().literal()
    );

    for changeset in report.get_changesets() {
        println!("  changeset {}", changeset.display());
    }

    if with_credentials {
        println!(
            "{}",
            "WARNING: don't forget to remove your docker hub credentials from your history !!"
                .error()
        );
    }

    Ok(())
}
