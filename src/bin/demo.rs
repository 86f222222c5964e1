//! Data Protection Demo
//!
//! Walks through field encryption, key rotation and backup codes against
//! in-memory storage.

use data_protection::prelude::*;
use data_protection::{Argon2Params, EncryptedField, FieldStorage};
use std::sync::Arc;

fn short(encoded: &str) -> String {
    if encoded.len() > 24 {
        format!("{}...{}", &encoded[..12], &encoded[encoded.len() - 6..])
    } else {
        encoded.to_string()
    }
}

async fn stored(storage: &InMemoryStorage, locator: &FieldLocator) -> Result<EncryptedField> {
    storage
        .get_field(locator)
        .await?
        .ok_or_else(|| ProtectionError::NotFound(locator.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║        DATA PROTECTION DEMO - Fields, Rotation, Codes        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    println!("📦 Initializing service with in-memory storage...");
    let storage = Arc::new(InMemoryStorage::new());
    let mut config = ServiceConfig::default();
    // Cheap Argon2 settings for the walkthrough
    config.backup_codes.argon2 = Argon2Params {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };
    let service = DataProtectionService::new(Arc::clone(&storage), &config)?;
    println!("   ✓ Ready");
    println!();

    // ========================================================================
    // Demo 1: Field encryption
    // ========================================================================
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📝 DEMO 1: Field Encryption");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let ssn = FieldLocator::new("acme", "employees", "ssn", "42");
    let outcome = service
        .vault()
        .encrypt_field(&ssn, b"123-45-6789", KeyPurpose::PersonalData)
        .await?;
    let row = stored(&storage, &ssn).await?;
    println!("   Field:      {}", ssn);
    println!("   Key:        {} (v{})", outcome.key_id, outcome.key_version);
    println!("   Key created on first use: {}", outcome.key_created);
    println!("   Ciphertext: {}", short(&row.ciphertext));

    let plaintext = service.vault().decrypt_field(&ssn).await?;
    println!("   Decrypted:  \"{}\"", String::from_utf8_lossy(&plaintext));

    service
        .vault()
        .encrypt_field(&ssn, b"123-45-6789", KeyPurpose::PersonalData)
        .await?;
    let again = stored(&storage, &ssn).await?;
    println!("   Same value re-encrypted gives new ciphertext: {}", again.ciphertext != row.ciphertext);
    println!();

    // ========================================================================
    // Demo 2: Key rotation
    // ========================================================================
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🔄 DEMO 2: Key Rotation");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for record in ["43", "44", "45"] {
        let locator = FieldLocator::new("acme", "employees", "ssn", record);
        service
            .vault()
            .encrypt_field(&locator, format!("000-00-00{}", record).as_bytes(), KeyPurpose::PersonalData)
            .await?;
    }

    let report = service.rotator().rotate("acme", KeyPurpose::PersonalData).await?;
    println!("   {}", report);
    for usage in service.vault().key_usage("acme", KeyPurpose::PersonalData).await? {
        println!(
            "      v{} active={} fields={}",
            usage.key.version, usage.key.is_active, usage.field_count
        );
    }
    let plaintext = service.vault().decrypt_field(&ssn).await?;
    println!("   Decrypt after rotation: \"{}\"", String::from_utf8_lossy(&plaintext));
    println!();

    // ========================================================================
    // Demo 3: Backup codes
    // ========================================================================
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🔑 DEMO 3: Backup Codes");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let issued = service.issuer().issue("acme", "alice").await?;
    println!("   Issued {} codes, expiring {}", issued.codes.len(), issued.expires_at);
    for code in &issued.codes {
        println!("      {}-{}", &code[..4], &code[4..]);
    }

    let code = &issued.codes[0];
    let lowercase = format!("{}-{}", code[..4].to_lowercase(), code[4..].to_lowercase());
    println!("   Verify \"{}\": {}", lowercase, service.verifier().verify("acme", "alice", &lowercase).await?);
    println!("   Verify again: {}", service.verifier().verify("acme", "alice", code).await?);
    println!("   Verify as bob: {}", service.verifier().verify("acme", "bob", &issued.codes[1]).await?);
    println!("   Remaining for alice: {}", service.verifier().remaining("acme", "alice").await?);

    let reissued = service.issuer().issue("acme", "alice").await?;
    println!("   Reissued {} codes", reissued.codes.len());
    println!(
        "   After reissue, an old code verifies: {}",
        service.verifier().verify("acme", "alice", &issued.codes[1]).await?
    );
    println!("   Remaining for alice: {}", service.verifier().remaining("acme", "alice").await?);
    println!();

    // ========================================================================
    // Demo 4: JSON requests
    // ========================================================================
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📨 DEMO 4: Request Surface");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let requests = [
        r#"{"op":"encrypt","organization_id":"acme","table":"accounts","field":"iban","record_id":"7","value":"DE89370400440532013000","purpose":"financial"}"#,
        r#"{"op":"decrypt","organization_id":"acme","table":"accounts","field":"iban","record_id":"7"}"#,
        r#"{"op":"decrypt","organization_id":"acme","table":"accounts","field":"iban","record_id":"8"}"#,
        r#"{"op":"rotate_key","organization_id":"acme","purpose":"financial"}"#,
    ];
    for raw in requests {
        let request: Request = serde_json::from_str(raw)?;
        let response = service.handle(request).await;
        println!("   → {}", raw);
        println!("   ← {}", serde_json::to_string(&response)?);
    }
    println!();

    println!("✓ Demo finished");
    Ok(())
}
