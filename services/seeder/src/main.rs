//! Seeder Service - Loads master catalog data into the portal database
//!
//! Responsibilities:
//! - Seed the catalogos table with the fixed master-data lists the portal
//!   offers as dropdown values
//! - Skip values that already exist, so re-running is always safe
//! - Track job runs for auditing

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "seeder", about = "Seeds master catalog data")]
struct Args {
    /// Dry run - list what would be inserted without writing
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// CATALOG DEFINITIONS
// =============================================================================

const ORIGENES_REQUERIMIENTO: &[&str] = &[
    "Reunión Ordinaria",
    "Reunión Extraordinaria",
    "Comité Técnico",
    "RQ del Área",
    "RQ de Gerencia",
    "RQ del Cliente",
];

const TIPOS_REQUERIMIENTO: &[&str] = &[
    "Observación",
    "No conformidad",
    "Recomendación",
    "Acuerdo",
    "Oportunidad de mejora",
];

const TIPOS_SERVICIO: &[&str] = &[
    "Asesoría",
    "Consultoría",
    "Asistencia",
    "Inducción",
    "Capacitación",
    "Entrenamiento",
    "Comercialización",
];

const TIPOS_INTERVENCION: &[&str] = &[
    "Asesor/Consultor",
    "Facilitador",
    "Instructor",
    "Coordinador",
    "Proveedor",
    "Colaborador",
    "Especialista",
    "Freelance",
];

const MEDIOS_CONTROL: &[&str] = &["Físico", "Digital", "Drive", "Presencial", "Virtual", "Mixto"];

const CONTROL_RESULTADOS: &[&str] = &[
    "Done/Hecho",
    "Release Ready",
    "Descarted/Descartado",
    "Blocked/Bloqueado",
    "Feedback",
];

const STATUS_ACTIVIDAD: &[&str] = &[
    "Entregado a Tiempo",
    "En Proceso",
    "Tiempo Límite",
    "Entregado Fuera de Plazo",
    "Recibido para su Atención",
    "Enviado para su Revisión",
    "Atrasado",
    "Bloqueado",
];

fn catalogs() -> Vec<(&'static str, &'static [&'static str])> {
    vec![
        ("origen_requerimiento", ORIGENES_REQUERIMIENTO),
        ("tipo_requerimiento", TIPOS_REQUERIMIENTO),
        ("tipo_servicio", TIPOS_SERVICIO),
        ("tipo_intervencion", TIPOS_INTERVENCION),
        ("medio_control", MEDIOS_CONTROL),
        ("control_resultados", CONTROL_RESULTADOS),
        ("status_actividad", STATUS_ACTIVIDAD),
    ]
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Insert the value if absent, returning whether a row was created.
/// Check-then-insert; the unique constraint on (tipo, nombre) is the backstop.
async fn seed_value(pool: &PgPool, tipo: &str, nombre: &str) -> Result<bool> {
    let existing: Option<(Uuid,)> =
        sqlx::query_as("SELECT catalogo_id FROM catalogos WHERE tipo = $1 AND nombre = $2")
            .bind(tipo)
            .bind(nombre)
            .fetch_optional(pool)
            .await?;

    if existing.is_some() {
        return Ok(false);
    }

    sqlx::query("INSERT INTO catalogos (catalogo_id, tipo, nombre) VALUES ($1, $2, $3)")
        .bind(Uuid::new_v4())
        .bind(tipo)
        .bind(nombre)
        .execute(pool)
        .await?;

    Ok(true)
}

async fn create_job_run(pool: &PgPool) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, source_id, status, detail)
        VALUES ($1, 'seeder', 'catalogos', 'running', '{}')
        "#,
    )
    .bind(job_run_id)
    .execute(pool)
    .await?;
    Ok(job_run_id)
}

async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    inserted: usize,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .bind(serde_json::json!({ "values_inserted": inserted }))
    .execute(pool)
    .await?;
    Ok(())
}

async fn run_seed(pool: &PgPool, dry_run: bool) -> Result<usize> {
    let mut total_inserted = 0;

    for (tipo, valores) in catalogs() {
        if dry_run {
            println!("  {} - {} values (dry run)", tipo, valores.len());
            continue;
        }

        let mut inserted = 0;
        let mut existing = 0;
        for nombre in valores {
            if seed_value(pool, tipo, nombre).await? {
                inserted += 1;
            } else {
                existing += 1;
            }
        }
        total_inserted += inserted;
        println!("  ✓ {}: {} new, {} existing", tipo, inserted, existing);
    }

    Ok(total_inserted)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;

    println!("=== Actividades Seeder ===");
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let job_run_id = if !args.dry_run {
        Some(create_job_run(&pool).await?)
    } else {
        None
    };

    let result = run_seed(&pool, args.dry_run).await;

    if let Some(job_id) = job_run_id {
        match &result {
            Ok(inserted) => finish_job_run(&pool, job_id, "ok", None, *inserted).await?,
            Err(e) => finish_job_run(&pool, job_id, "failed", Some(&e.to_string()), 0).await?,
        }
    }

    let inserted = result?;
    println!("\n=== Seed Complete ===");
    println!("Values inserted: {}", inserted);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_tipos_are_unique() {
        let tipos: Vec<&str> = catalogs().iter().map(|(tipo, _)| *tipo).collect();
        let unique: HashSet<&str> = tipos.iter().copied().collect();
        assert_eq!(tipos.len(), unique.len());
    }

    #[test]
    fn test_catalog_values_have_no_duplicates() {
        for (tipo, valores) in catalogs() {
            let unique: HashSet<&str> = valores.iter().copied().collect();
            assert_eq!(valores.len(), unique.len(), "duplicate value in {}", tipo);
        }
    }

    #[test]
    fn test_catalogs_are_non_empty() {
        for (tipo, valores) in catalogs() {
            assert!(!valores.is_empty(), "catalog {} is empty", tipo);
        }
    }
}
