use ctxsync::workspace::MembershipChange;
use ctxsync::{EngineConfig, Result, Workspace};

pub fn add(config: &EngineConfig, name: &str, public_key: &str) -> Result<()> {
    let change = Workspace::open(config)?.add_member(name, public_key)?;
    println!(
        "Added '{}' ({})",
        change.recipient.name, change.recipient.fingerprint
    );
    println!("Confirm the fingerprint with them over another channel.");
    report(&change);
    Ok(())
}

pub fn list(config: &EngineConfig) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let registry = workspace.registry()?;

    println!(
        "owner  {}  (this machine)",
        ctxsync::recipients::fingerprint(&registry.owner_public_key)
    );
    if registry.members().is_empty() {
        println!("\nNo team members. Add one with: ctxsync team add <name> <public-key>");
        return Ok(());
    }

    for member in registry.members() {
        println!(
            "{}  {}  added {}",
            member.name,
            member.fingerprint,
            member.added_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

pub fn remove(config: &EngineConfig, name: &str) -> Result<()> {
    let change = Workspace::open(config)?.remove_member(name)?;
    println!("Removed '{}'", change.recipient.name);
    report(&change);
    Ok(())
}

pub fn revoke(config: &EngineConfig, public_key: &str) -> Result<()> {
    let change = Workspace::open(config)?.revoke_member(public_key)?;
    println!(
        "Revoked '{}' ({})",
        change.recipient.name, change.recipient.fingerprint
    );
    report(&change);
    Ok(())
}

fn report(change: &MembershipChange) {
    println!("Re-encrypted {} file(s)", change.reencrypted.len());
    for filename in &change.reencrypted {
        println!("  {filename}");
    }
    println!("\nRun 'ctxsync push' to publish the change.");
}
