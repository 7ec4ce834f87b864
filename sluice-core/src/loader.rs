use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;
use loader_factory::PipelineVariant;

use crate::{loader_factory, DeviceMap, StagingPlan};

pub trait Loader {
    type Pipeline;

    fn load(
        variant: PipelineVariant,
        api: Api,
        device_map: DeviceMap,
        plan: StagingPlan,
    ) -> impl Future<Output = Result<Self::Pipeline>>
    where
        Self: Sized;
}
