use anyhow::{
    Context,
    Result,
    anyhow,
};
use chrono::Utc;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

pub const DEPLOYMENTS_ROOT: &str = ".deployments";
const DEPLOYMENTS_FILE: &str = "deployments.json";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentEnv {
    Dev,
    Test,
    Local,
}

impl DeploymentEnv {
    pub fn dir_name(self) -> &'static str {
        match self {
            DeploymentEnv::Dev => "dev",
            DeploymentEnv::Test => "test",
            DeploymentEnv::Local => "local",
        }
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentEnv::Dev => "Devnet",
            DeploymentEnv::Test => "Testnet",
            DeploymentEnv::Local => "Local",
        };
        write!(f, "{name}")
    }
}

/// Where a client finds the world contract and its event feeds on one network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub recorded_at: String,
    pub stream_url: String,
    #[serde(default)]
    pub rpc_url: Option<String>,
    pub world_address: String,
    pub chain_id: u64,
    /// Block the world was deployed at; sync starts here without a checkpoint.
    #[serde(default)]
    pub start_block: Option<u64>,
}

#[derive(Debug)]
pub struct DeploymentStore {
    path: PathBuf,
}

impl DeploymentStore {
    pub fn new(env: DeploymentEnv) -> Result<Self> {
        Self::in_root(DEPLOYMENTS_ROOT, env)
    }

    /// Store under an explicit root instead of the working directory.
    pub fn in_root(root: impl AsRef<Path>, env: DeploymentEnv) -> Result<Self> {
        let path = ensure_store(root.as_ref(), env)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<NetworkRecord>> {
        read_record(&self.path)
    }

    pub fn save(&self, record: &NetworkRecord) -> Result<()> {
        write_record(&self.path, record)
    }
}

fn ensure_store(root: &Path, env: DeploymentEnv) -> Result<PathBuf> {
    let env_dir = root.join(env.dir_name());
    if !env_dir.exists() {
        fs::create_dir_all(&env_dir).with_context(|| {
            format!("Failed to create deployments directory {}", env_dir.display())
        })?;
    }

    let file_path = env_dir.join(DEPLOYMENTS_FILE);
    if !file_path.exists() {
        fs::write(&file_path, b"").with_context(|| {
            format!(
                "Failed to create network record file for {} at {:?}",
                env, file_path
            )
        })?;
    }

    Ok(file_path)
}

fn read_record(path: impl AsRef<Path>) -> Result<Option<NetworkRecord>> {
    let data = fs::read(path.as_ref()).context("Failed to read network records")?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    if let Ok(record) = serde_json::from_slice::<NetworkRecord>(&data) {
        return Ok(Some(record));
    }
    if let Ok(mut records) = serde_json::from_slice::<Vec<NetworkRecord>>(&data) {
        return Ok(records.pop());
    }
    Err(anyhow!(
        "Failed to parse network record JSON; expected a single network object"
    ))
}

fn write_record(path: impl AsRef<Path>, record: &NetworkRecord) -> Result<()> {
    let json =
        serde_json::to_vec_pretty(record).context("Failed to serialize network record")?;
    fs::write(path.as_ref(), json).context("Failed to write network record")?;
    Ok(())
}

pub fn record_network(
    store: &DeploymentStore,
    stream_url: impl AsRef<str>,
    rpc_url: Option<impl AsRef<str>>,
    world_address: impl AsRef<str>,
    chain_id: u64,
    start_block: Option<u64>,
) -> Result<NetworkRecord> {
    let record = NetworkRecord {
        recorded_at: Utc::now().to_rfc3339(),
        stream_url: stream_url.as_ref().to_string(),
        rpc_url: rpc_url.map(|url| url.as_ref().to_string()),
        world_address: world_address.as_ref().to_string(),
        chain_id,
        start_block,
    };
    store.save(&record)?;
    Ok(record)
}
