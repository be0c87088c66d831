use anyhow::Result;
use clap::Parser;
use config::Config;
use xui_migrate::migrate;
use xui_migrate::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "xui-migrate")]
#[command(about = "Migrates proxy accounts from a 3x-ui panel to a Pasarguard panel")]
#[command(version)]
struct Args {
    /// Path to the yaml config file
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Read and report without writing to the target database
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();

    let builder = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;
    let settings: Settings = builder.try_deserialize()?;

    let counters = migrate::run(&settings, args.dry_run).await?;

    println!("================================================================");
    println!(
        "Migration complete{}",
        if args.dry_run { " (dry run)" } else { "" }
    );
    println!("================================================================");
    println!("Imported new users:     {}", counters.imported);
    println!("Updated existing users: {}", counters.updated);
    println!("Skipped:                {}", counters.skipped);
    println!("Errors:                 {}", counters.errors);
    println!("Total processed:        {}", counters.total());
    if !args.dry_run {
        println!();
        println!("Restart Pasarguard after migrating so the core config picks up the new users.");
    }
    Ok(())
}
