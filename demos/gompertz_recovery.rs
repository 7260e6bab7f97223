use gompertz_mortality::{
    AgeGrid, GompertzConfig, GompertzParams, ObservationModel, SamplerConfig,
    SimulatedObservation, SimulatedStratum, StratumKey, fit_gompertz, panel_diagnostics,
    simulate_panel,
};

const TRUE_LOG_ALPHA: f64 = -6.0;
const TRUE_BETA: f64 = 0.1;
const EXPOSURE: f64 = 100_000.0;
const SIMULATION_SEED: u64 = 41;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let grid = AgeGrid::new(40, 59)?;
    let truth = GompertzParams::new(TRUE_LOG_ALPHA, TRUE_BETA);
    let panel = simulate_panel(
        grid,
        40.0,
        &[SimulatedStratum {
            key: StratumKey::default(),
            params: truth,
            observation: SimulatedObservation::Counts { exposure: EXPOSURE },
        }],
        SIMULATION_SEED,
    )?;
    let data = panel_diagnostics(&panel);

    let config = GompertzConfig {
        sampler: SamplerConfig {
            num_chains: 4,
            num_warmup: 1_000,
            num_draws: 2_000,
            seed: 2_026,
            ..SamplerConfig::default()
        },
        ..GompertzConfig::default()
    };
    let fit = fit_gompertz(&panel, ObservationModel::Count, config)?;
    let summary = fit.require_summary()?;
    let convergence = fit.require_convergence()?;

    println!("Gompertz parameter recovery");
    println!(
        "Synthetic cross-section: ages {}..{}, exposure {EXPOSURE} per age, {} deaths (crude rate {:.5})",
        grid.start(),
        grid.end(),
        data.total_deaths,
        data.crude_rate.unwrap_or(f64::NAN)
    );
    println!(
        "Sampler: {} chains x {} draws, {} divergences",
        fit.chains.len(),
        config.sampler.num_draws,
        convergence.divergences
    );
    for chain in &fit.chains {
        println!(
            "  chain {}: step size {:.4}, mean accept {:.2}, mean tree depth {:.1}",
            chain.chain_id, chain.step_size, chain.mean_accept_prob, chain.mean_tree_depth
        );
    }

    println!("\n{}", summary.render_table());
    println!("{}", convergence.render_table());
    for nqx in fit.nqx_summary(40, 59)? {
        println!(
            "{:<18} {:>10.4} {:>10.4} {:>10.4}",
            nqx.name, nqx.median, nqx.lower, nqx.upper
        );
    }

    let beta = summary.get("beta[all]").ok_or("missing beta summary")?;
    let log_alpha = summary
        .get("log_alpha[all]")
        .ok_or("missing log_alpha summary")?;
    let checks = [
        (
            "beta median in [0.08, 0.12]",
            (0.08..=0.12).contains(&beta.median),
        ),
        (
            "log_alpha median in [-6.3, -5.7]",
            (-6.3..=-5.7).contains(&log_alpha.median),
        ),
        (
            "beta interval covers truth",
            beta.lower <= TRUE_BETA && TRUE_BETA <= beta.upper,
        ),
        ("all parameters converged", convergence.all_converged),
    ];

    println!("\nValidation checks");
    let passed = checks.iter().filter(|(_, ok)| *ok).count();
    for (name, ok) in checks {
        let status = if ok { "PASS" } else { "FAIL" };
        println!("{name}: {status}");
    }
    println!("Checks passed: {passed}/{}", checks.len());

    Ok(())
}
