use anyhow::{Context, Result};
use artsync_config::Config;
use artsync_storage::ContentCache;

use crate::cli::CacheCommands;

pub fn handle(cmd: CacheCommands, config: &Config) -> Result<()> {
    let cache = ContentCache::new(config.cache_dir.clone())?;
    match cmd {
        CacheCommands::Cleanup {
            target_size,
            keep_temp,
        } => cleanup(&cache, &target_size, keep_temp),
        CacheCommands::Path { digest, size } => path(&cache, &digest, size),
    }
}

fn cleanup(cache: &ContentCache, target_size: &str, keep_temp: bool) -> Result<()> {
    let target = parse_size(target_size)?;
    let reclaimed = cache.cleanup(target, !keep_temp)?;
    println!("✓ Reclaimed {} bytes", reclaimed);
    println!("  Cache: {}", cache.root().display());
    Ok(())
}

fn path(cache: &ContentCache, digest: &str, size: u64) -> Result<()> {
    let (path, hit, _) = cache.check_md5_obj_path(digest, size)?;
    println!("{}", path.display());
    if hit {
        println!("✓ Cached");
    } else {
        println!("  Not cached");
    }
    Ok(())
}

/// Parses sizes such as `1024`, `500MB`, `2GiB` or `1.5 kb`.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .with_context(|| format!("Invalid size: {}", input))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1_000,
        "mb" | "m" => 1_000_000,
        "gb" | "g" => 1_000_000_000,
        "tb" | "t" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        other => anyhow::bail!("Unknown size unit: {}", other),
    };
    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("500MB").unwrap(), 500_000_000);
        assert_eq!(parse_size("2GiB").unwrap(), 2_147_483_648);
        assert_eq!(parse_size("1.5 kb").unwrap(), 1_500);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("lots").is_err());
        assert!(parse_size("10 parsecs").is_err());
    }
}
