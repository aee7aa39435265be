use std::process::ExitCode;
use stress_test::{stress_test_replicas, stress_test_scaling};
use tracing_subscriber::{prelude::*, EnvFilter};


#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(true) => {
            println!("\n✓ All stress tests converged!");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("\n✗ Some replicas did not converge");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("stress test failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<bool, thicket_sdk::SdkError> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICATED LOG STRESS TESTS                      ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut converged = true;

    // Test 1: reliable gossip, sync only confirms
    let stats = stress_test_replicas(4, 100, 0.0).await?;
    stats.print();
    converged &= stats.converged;

    // Test 2: half of all gossip is lost
    let stats = stress_test_replicas(4, 100, 0.5).await?;
    stats.print();
    converged &= stats.converged;

    // Test 3: no gossip at all, sync carries everything
    let stats = stress_test_replicas(8, 100, 1.0).await?;
    stats.print();
    converged &= stats.converged;

    // Test 4: scaling analysis
    converged &= stress_test_scaling(16, 4).await?;

    Ok(converged)
}
