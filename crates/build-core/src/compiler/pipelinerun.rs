use std::collections::BTreeMap;
use std::mem;

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use crate::compiler::ca_bundle::apply_ca_bundle;
use crate::compiler::image_processing::{
    PIPELINE_OUTPUT_DIRECTORY, image_processing_step, processing_args,
};
use crate::compiler::params::strategy_params;
use crate::compiler::security_context::apply_security_context;
use crate::compiler::sources::{RESULT_SOURCE_TIMESTAMP, append_source_step};
use crate::compiler::task_spec::{
    base_param_references, base_param_specs, base_param_values, base_task_spec, job_metadata,
    output_directory_param_spec, param_reference, strategy_param_specs, strategy_steps,
    strategy_volumes, uses_output_directory,
};
use crate::compiler::{
    CompileInput, DEFAULT_SOURCE_NAME, ExecutionContext, Executor, ExecutorGenerator,
    PARAM_OUTPUT_DIRECTORY, StageError, WORKSPACE_SOURCE, source_result_name,
};
use crate::crds::strategy::{Parameter, ParameterType};
use crate::crds::tekton::{
    Param, PipelineRun, PipelineRunSpec, PipelineSpec, PipelineTask, PipelineTaskRunTemplate,
    PipelineWorkspaceDeclaration, TaskSpec, TimeoutFields, WorkspaceBinding,
    WorkspacePipelineTaskBinding,
};
use crate::labels::is_propagatable_annotation;
use crate::resolver::{effective_ca_bundle, effective_timeout, pod_template};

pub const TASK_SOURCE_ACQUISITION: &str = "source-acquisition";
pub const TASK_BUILD_STRATEGY: &str = "build-strategy";
pub const TASK_OUTPUT_IMAGE: &str = "output-image";

const WORKSPACE_CACHE: &str = "cache";
const SOURCE_WORKSPACE_SIZE: &str = "1Gi";

/// Compiles a BuildRun into a PipelineRun with one task per phase. The tasks
/// hand files over through a claim-backed `source` workspace.
pub struct PipelineRunGenerator<'a> {
    input: CompileInput<'a>,
    pipeline_run: PipelineRun,
    tasks: Vec<PipelineTask>,
    /// Collected from every task's security context until metadata is applied.
    annotations: BTreeMap<String, String>,
}

fn pipeline_spec_mut(pipeline_run: &mut PipelineRun) -> &mut PipelineSpec {
    pipeline_run
        .spec
        .pipeline_spec
        .get_or_insert_with(PipelineSpec::default)
}

fn workspace_bindings(names: &[&str]) -> Vec<WorkspacePipelineTaskBinding> {
    names
        .iter()
        .map(|name| WorkspacePipelineTaskBinding {
            name: name.to_string(),
            workspace: name.to_string(),
        })
        .collect()
}

fn source_claim_template() -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(SOURCE_WORKSPACE_SIZE.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Passes a pipeline param through to a task param of the same name.
fn strategy_param_reference(parameter: &Parameter) -> Param {
    match parameter.type_ {
        ParameterType::String => param_reference(&parameter.name),
        ParameterType::Array => Param::array(
            parameter.name.clone(),
            vec![format!("$(params.{}[*])", parameter.name)],
        ),
    }
}

impl<'a> PipelineRunGenerator<'a> {
    pub fn new(input: CompileInput<'a>) -> Self {
        Self {
            input,
            pipeline_run: PipelineRun {
                metadata: Default::default(),
                spec: PipelineRunSpec::default(),
                status: None,
            },
            tasks: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    fn task_spec(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks
            .iter()
            .find(|task| task.name == name)
            .and_then(|task| task.task_spec.as_ref())
    }

    fn push_task(
        &mut self,
        name: &str,
        mut spec: TaskSpec,
        run_after: Option<&str>,
        params: Vec<Param>,
        workspaces: &[&str],
    ) {
        apply_security_context(&mut spec, &mut self.annotations, &self.input.strategy.spec);

        self.tasks.push(PipelineTask {
            name: name.to_string(),
            task_spec: Some(spec),
            run_after: run_after.into_iter().map(str::to_string).collect(),
            params,
            workspaces: workspace_bindings(workspaces),
        });
    }
}

impl ExecutorGenerator for PipelineRunGenerator<'_> {
    fn initialize(&mut self) -> Result<(), StageError> {
        let input = self.input;

        self.pipeline_run.metadata = job_metadata(input.build, input.buildrun);
        self.pipeline_run.spec = PipelineRunSpec {
            pipeline_spec: Some(PipelineSpec {
                params: base_param_specs(),
                workspaces: vec![
                    PipelineWorkspaceDeclaration {
                        name: WORKSPACE_SOURCE.to_string(),
                        description: "Workspace for source code and build artifacts".to_string(),
                        optional: false,
                    },
                    PipelineWorkspaceDeclaration {
                        name: WORKSPACE_CACHE.to_string(),
                        description: "Cache workspace for build artifacts".to_string(),
                        optional: true,
                    },
                ],
                ..Default::default()
            }),
            workspaces: vec![
                WorkspaceBinding {
                    name: WORKSPACE_SOURCE.to_string(),
                    empty_dir: None,
                    volume_claim_template: Some(source_claim_template()),
                },
                WorkspaceBinding {
                    name: WORKSPACE_CACHE.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    volume_claim_template: None,
                },
            ],
            task_run_template: Some(PipelineTaskRunTemplate {
                service_account_name: Some(input.service_account.to_string())
                    .filter(|sa| !sa.is_empty()),
                pod_template: None,
            }),
            ..Default::default()
        };
        Ok(())
    }

    fn source_acquisition(&mut self, _ctx: &mut ExecutionContext) -> Result<(), StageError> {
        let input = self.input;

        let mut spec = base_task_spec();
        append_source_step(input.config, &mut spec, input.build.spec.source.as_ref());
        // Tekton rejects a task without steps.
        if spec.steps.is_empty() {
            return Ok(());
        }

        self.push_task(
            TASK_SOURCE_ACQUISITION,
            spec,
            None,
            base_param_references(),
            &[WORKSPACE_SOURCE],
        );
        Ok(())
    }

    fn build_strategy(&mut self, ctx: &mut ExecutionContext) -> Result<(), StageError> {
        let input = self.input;
        let parameters = &input.strategy.spec.parameters;

        let mut spec = base_task_spec();
        spec.params.extend(strategy_param_specs(parameters));

        let (steps, mounts) = strategy_steps(&input, &ctx.combined_env)?;
        ctx.output_directory = uses_output_directory(&input, &steps);
        spec.steps.extend(steps);
        for volume in strategy_volumes(&input, &mounts)? {
            if !spec.has_volume(&volume.name) {
                spec.volumes.push(volume);
            }
        }

        let mut params = base_param_references();
        params.extend(parameters.iter().map(strategy_param_reference));

        let pipeline_spec = pipeline_spec_mut(&mut self.pipeline_run);
        pipeline_spec.params.extend(strategy_param_specs(parameters));
        if ctx.output_directory {
            spec.params.push(output_directory_param_spec());
            pipeline_spec.params.push(output_directory_param_spec());
            params.push(param_reference(PARAM_OUTPUT_DIRECTORY));
        }

        let run_after = self
            .task_spec(TASK_SOURCE_ACQUISITION)
            .map(|_| TASK_SOURCE_ACQUISITION);
        self.push_task(
            TASK_BUILD_STRATEGY,
            spec,
            run_after,
            params,
            &[WORKSPACE_SOURCE, WORKSPACE_CACHE],
        );
        Ok(())
    }

    fn output_image(&mut self, ctx: &mut ExecutionContext) -> Result<(), StageError> {
        let input = self.input;

        let timestamp_result = source_result_name(DEFAULT_SOURCE_NAME, RESULT_SOURCE_TIMESTAMP);
        let source_timestamp = self
            .task_spec(TASK_SOURCE_ACQUISITION)
            .filter(|spec| spec.has_result(&timestamp_result))
            .map(|_| {
                [
                    "--image-timestamp".to_string(),
                    format!("$(tasks.{TASK_SOURCE_ACQUISITION}.results.{timestamp_result})"),
                ]
            });

        let args = processing_args(&input, ctx.output_directory, source_timestamp)?;
        if args.is_empty() {
            return Ok(());
        }

        let mut spec = base_task_spec();
        let mut params = base_param_references();
        if ctx.output_directory {
            spec.params.push(output_directory_param_spec());
            params.push(param_reference(PARAM_OUTPUT_DIRECTORY));
        }

        // The output directory lives in the shared workspace, so no extra mount.
        let step = image_processing_step(&input, &mut spec, args, false);
        spec.steps.push(step);

        self.push_task(
            TASK_OUTPUT_IMAGE,
            spec,
            Some(TASK_BUILD_STRATEGY),
            params,
            &[WORKSPACE_SOURCE],
        );
        Ok(())
    }

    fn infrastructure(&mut self) -> Result<(), StageError> {
        let input = self.input;

        let template = pod_template(&input.build.spec, &input.buildrun.spec);
        if !template.is_empty() {
            self.pipeline_run
                .spec
                .task_run_template
                .get_or_insert_with(PipelineTaskRunTemplate::default)
                .pod_template = Some(template);
        }

        if let Some(bundle) = effective_ca_bundle(&input.build.spec, &input.buildrun.spec) {
            for spec in self.tasks.iter_mut().filter_map(|t| t.task_spec.as_mut()) {
                apply_ca_bundle(spec, &bundle);
            }
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
        annotations.append(&mut self.annotations);
        if !annotations.is_empty() {
            self.pipeline_run.annotations_mut().extend(annotations);
        }
        self.pipeline_run
            .labels_mut()
            .extend(input.strategy.resource_labels());

        self.pipeline_run.spec.timeouts =
            effective_timeout(&input.build.spec, &input.buildrun.spec).map(|timeout| {
                TimeoutFields {
                    pipeline: Some(timeout),
                }
            });

        let build_steps = self
            .tasks
            .iter_mut()
            .find(|task| task.name == TASK_BUILD_STRATEGY)
            .and_then(|task| task.task_spec.as_mut())
            .map(|spec| spec.steps.as_mut_slice())
            .unwrap_or_default();
        let mut params = base_param_values(&input.build.spec, &input.buildrun.spec);
        params.extend(strategy_params(&input, build_steps)?);

        let pipeline_spec = pipeline_spec_mut(&mut self.pipeline_run);
        if pipeline_spec
            .params
            .iter()
            .any(|p| p.name == PARAM_OUTPUT_DIRECTORY)
        {
            params.push(Param::string(PARAM_OUTPUT_DIRECTORY, PIPELINE_OUTPUT_DIRECTORY));
        }
        pipeline_spec.tasks = mem::take(&mut self.tasks);
        self.pipeline_run.spec.params = params;
        Ok(())
    }

    fn into_executor(self) -> Executor {
        Executor::PipelineRun(Box::new(self.pipeline_run))
    }
}
