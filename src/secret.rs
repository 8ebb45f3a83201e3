//! O segredo compartilhado pelos workers para autenticar chamadas de disparo.

use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::store::CoordinationStore;

const SECRET_KEY: &str = "worker-secret";

/// Retorna o segredo gravado, gerando-o no primeiro uso. Chamadas
/// concorrentes no primeiro uso recebem todas o mesmo valor.
pub async fn load_or_create(store: &dyn CoordinationStore) -> Result<String> {
    if let Some(secret) = store.get(SECRET_KEY).await? {
        return Ok(secret);
    }
    let candidate = Uuid::new_v4().simple().to_string();
    let secret = store.put_if_absent(SECRET_KEY, &candidate).await?;
    if secret == candidate {
        info!("generated worker secret");
    }
    Ok(secret)
}

/// Compara dois segredos sem parar na primeira diferença.
pub fn matches(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
