use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Volume, VolumeMount};
use kube::ResourceExt;

use crate::compiler::ca_bundle::apply_ca_bundle;
use crate::compiler::image_processing::{
    OUTPUT_DIRECTORY_MOUNT_PATH, image_processing_step, processing_args,
};
use crate::compiler::params::strategy_params;
use crate::compiler::security_context::apply_security_context;
use crate::compiler::sources::{RESULT_SOURCE_TIMESTAMP, append_source_step};
use crate::compiler::task_spec::{
    base_param_values, base_task_spec, job_metadata, output_directory_consumers,
    output_directory_param_spec, strategy_param_specs, strategy_steps, strategy_volumes,
    uses_output_directory,
};
use crate::compiler::{
    CompileInput, DEFAULT_SOURCE_NAME, ExecutionContext, Executor, ExecutorGenerator,
    PARAM_OUTPUT_DIRECTORY, StageError, WORKSPACE_SOURCE, source_result_name,
};
use crate::crds::tekton::{Param, TaskRun, TaskRunSpec, TaskSpec, WorkspaceBinding};
use crate::labels::is_propagatable_annotation;
use crate::resolver::{effective_ca_bundle, effective_timeout, pod_template};

/// Compiles a BuildRun into a single TaskRun running every step in one pod.
pub struct TaskRunGenerator<'a> {
    input: CompileInput<'a>,
    task_run: TaskRun,
}

fn task_spec_mut(task_run: &mut TaskRun) -> &mut TaskSpec {
    task_run.spec.task_spec.get_or_insert_with(TaskSpec::default)
}

impl<'a> TaskRunGenerator<'a> {
    pub fn new(input: CompileInput<'a>) -> Self {
        Self {
            input,
            task_run: TaskRun {
                metadata: Default::default(),
                spec: TaskRunSpec::default(),
                status: None,
            },
        }
    }
}

impl ExecutorGenerator for TaskRunGenerator<'_> {
    fn initialize(&mut self) -> Result<(), StageError> {
        let input = self.input;

        self.task_run.metadata = job_metadata(input.build, input.buildrun);
        self.task_run.spec = TaskRunSpec {
            service_account_name: Some(input.service_account.to_string())
                .filter(|sa| !sa.is_empty()),
            task_spec: Some(base_task_spec()),
            workspaces: vec![WorkspaceBinding {
                name: WORKSPACE_SOURCE.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                volume_claim_template: None,
            }],
            ..Default::default()
        };
        Ok(())
    }

    fn source_acquisition(&mut self, _ctx: &mut ExecutionContext) -> Result<(), StageError> {
        let input = self.input;
        append_source_step(
            input.config,
            task_spec_mut(&mut self.task_run),
            input.build.spec.source.as_ref(),
        );
        Ok(())
    }

    fn build_strategy(&mut self, ctx: &mut ExecutionContext) -> Result<(), StageError> {
        let input = self.input;
        let spec = task_spec_mut(&mut self.task_run);

        spec.params
            .extend(strategy_param_specs(&input.strategy.spec.parameters));

        let (steps, mounts) = strategy_steps(&input, &ctx.combined_env)?;
        ctx.output_directory = uses_output_directory(&input, &steps);
        spec.steps.extend(steps);

        for volume in strategy_volumes(&input, &mounts)? {
            if !spec.has_volume(&volume.name) {
                spec.volumes.push(volume);
            }
        }
        Ok(())
    }

    fn output_image(&mut self, ctx: &mut ExecutionContext) -> Result<(), StageError> {
        let input = self.input;

        if ctx.output_directory {
            self.task_run.spec.params.push(Param::string(
                PARAM_OUTPUT_DIRECTORY,
                OUTPUT_DIRECTORY_MOUNT_PATH,
            ));

            let spec = task_spec_mut(&mut self.task_run);
            spec.params.push(output_directory_param_spec());
            spec.volumes.push(Volume {
                name: PARAM_OUTPUT_DIRECTORY.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            for step in output_directory_consumers(&mut spec.steps, &input.strategy.spec.steps) {
                step.volume_mounts.push(VolumeMount {
                    name: PARAM_OUTPUT_DIRECTORY.to_string(),
                    mount_path: OUTPUT_DIRECTORY_MOUNT_PATH.to_string(),
                    ..Default::default()
                });
            }
        }

        let spec = task_spec_mut(&mut self.task_run);
        let timestamp_result = source_result_name(DEFAULT_SOURCE_NAME, RESULT_SOURCE_TIMESTAMP);
        let source_timestamp = spec.has_result(&timestamp_result).then(|| {
            [
                "--image-timestamp-file".to_string(),
                format!("$(results.{timestamp_result}.path)"),
            ]
        });

        let args = processing_args(&input, ctx.output_directory, source_timestamp)?;
        if !args.is_empty() {
            let step = image_processing_step(&input, spec, args, ctx.output_directory);
            spec.steps.push(step);
        }
        Ok(())
    }

    fn infrastructure(&mut self) -> Result<(), StageError> {
        let input = self.input;

        let template = pod_template(&input.build.spec, &input.buildrun.spec);
        if !template.is_empty() {
            self.task_run.spec.pod_template = Some(template);
        }

        if let Some(bundle) = effective_ca_bundle(&input.build.spec, &input.buildrun.spec) {
            apply_ca_bundle(task_spec_mut(&mut self.task_run), &bundle);
        }
        Ok(())
    }

    fn metadata(&mut self) -> Result<(), StageError> {
        let input = self.input;

        let mut annotations: BTreeMap<String, String> = input
            .strategy
            .annotations
            .iter()
            .filter(|(key, _)| is_propagatable_annotation(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        apply_security_context(
            task_spec_mut(&mut self.task_run),
            &mut annotations,
            &input.strategy.spec,
        );
        if !annotations.is_empty() {
            self.task_run.annotations_mut().extend(annotations);
        }
        self.task_run
            .labels_mut()
            .extend(input.strategy.resource_labels());

        self.task_run.spec.timeout = effective_timeout(&input.build.spec, &input.buildrun.spec);

        let mut params = base_param_values(&input.build.spec, &input.buildrun.spec);
        params.append(&mut self.task_run.spec.params);
        params.extend(strategy_params(
            &input,
            &mut task_spec_mut(&mut self.task_run).steps,
        )?);
        self.task_run.spec.params = params;
        Ok(())
    }

    fn into_executor(self) -> Executor {
        Executor::TaskRun(Box::new(self.task_run))
    }
}
