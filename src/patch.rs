//! Status write helpers with optimistic-concurrency retry.
//!
//! Every status write in the control plane is a compare-by-resourceVersion
//! replace. The helper re-reads before each attempt, so the mutate closure
//! always sees the freshest status and a lost race never stomps a concurrent
//! transition.

use kube::api::{Api, PostParams};
use kube::core::object::HasStatus;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::errors::{Error, is_conflict};

/// Write attempts before giving up and letting the caller requeue.
const MAX_ATTEMPTS: u32 = 3;

/// Re-read the object and replace its status, retrying on resourceVersion
/// conflicts up to three times. A mutation that leaves the status unchanged
/// produces no write at all, which keeps repeated reconciles of a settled
/// resource observation-free.
pub async fn update_status<K, F>(api: &Api<K>, name: &str, mutate: F) -> Result<K, Error>
where
    K: kube::Resource<DynamicType = ()>
        + HasStatus
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
    <K as HasStatus>::Status: Default + Serialize,
    F: Fn(&mut <K as HasStatus>::Status),
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut latest = api.get(name).await?;
        let status = latest.status_mut().get_or_insert_with(Default::default);
        let before = serde_json::to_value(&*status)?;
        mutate(status);
        if serde_json::to_value(&*status)? == before {
            return Ok(latest);
        }
        match api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&latest)?)
            .await
        {
            Ok(obj) => return Ok(obj),
            Err(err) if is_conflict(&err) && attempt < MAX_ATTEMPTS => continue,
            Err(err) if is_conflict(&err) => {
                return Err(Error::Conflict(name.to_string(), attempt));
            }
            Err(err) => return Err(err.into()),
        }
    }
}
