//! Sub-model session handles.
//!
//! Every neural sub-model (tokenizer, text encoder, UNet, ControlNet, VAE
//! encoder/decoder) is held behind an [`OnnxModelSession`]: an explicit
//! Loaded/Unloaded state machine around one `ort` session. Unloaded handles
//! stay addressable and keep serving metadata from the signature cached at
//! first load.

use std::sync::{Arc, Mutex, OnceLock};

use ndarray::ArrayD;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor;

use diffusionkit_core::config::{ExecutionProviderHint, SubModelConfig};
use diffusionkit_core::{DiffusionError, Result};

/// Process-wide backend options. Applied exactly once through [`init_runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub name: String,
    /// Ceiling for the backend's contiguous device buffer pool, in bytes.
    pub memory_pool_bytes: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self { name: "diffusionkit".to_string(), memory_pool_bytes: 100 * 1024 * 1024 }
    }
}

static RUNTIME_OPTIONS: OnceLock<RuntimeOptions> = OnceLock::new();

/// Initializes the ONNX environment and the shared tensor memory pool. Must be
/// called once by the host before any session is loaded; a second call is an
/// error.
pub fn init_runtime(options: RuntimeOptions) -> Result<()> {
    if RUNTIME_OPTIONS.get().is_some() {
        return Err(DiffusionError::InvalidOptions(
            "runtime already initialized".to_string(),
        ));
    }
    ort::init()
        .with_name(&options.name)
        .commit()
        .map_err(|e| DiffusionError::model_load("onnx-environment", e))?;
    tracing::info!(
        pool_bytes = options.memory_pool_bytes,
        "ONNX runtime environment initialized"
    );
    let _ = RUNTIME_OPTIONS.set(options);
    Ok(())
}

/// The options the host initialized the runtime with, if any.
pub fn runtime_options() -> Option<&'static RuntimeOptions> {
    RUNTIME_OPTIONS.get()
}

/// Signature of one graph input or output.
#[derive(Debug, Clone)]
pub struct TensorSignature {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: String,
}

/// Cached graph signature; survives unload.
#[derive(Debug, Clone, Default)]
pub struct ModelMetadata {
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
}

/// One typed input tensor, in graph input order.
#[derive(Debug, Clone)]
pub enum InputValue {
    Float(ArrayD<f32>),
    Double(ArrayD<f64>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    /// 1-D string tensor; only the tokenizer takes this.
    Text(Vec<String>),
}

/// One extracted output tensor.
#[derive(Debug, Clone)]
pub enum OutputValue {
    Float(ArrayD<f32>),
    Int64(ArrayD<i64>),
}

impl OutputValue {
    pub fn into_float(self) -> Result<ArrayD<f32>> {
        match self {
            OutputValue::Float(t) => Ok(t),
            OutputValue::Int64(t) => Err(DiffusionError::shape("float32 tensor", format!("int64 {:?}", t.shape()))),
        }
    }

    pub fn into_int64(self) -> Result<ArrayD<i64>> {
        match self {
            OutputValue::Int64(t) => Ok(t),
            OutputValue::Float(t) => Err(DiffusionError::shape("int64 tensor", format!("float32 {:?}", t.shape()))),
        }
    }
}

/// Builder for one inference call: inputs in graph order plus optional
/// pre-declared output shapes (empty shape lets the backend allocate).
#[derive(Debug, Clone, Default)]
pub struct OnnxInferenceParameters {
    inputs: Vec<InputValue>,
    output_shapes: Vec<Vec<usize>>,
}

impl OnnxInferenceParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input_tensor(mut self, tensor: ArrayD<f32>) -> Self {
        self.inputs.push(InputValue::Float(tensor));
        self
    }

    pub fn add_input(mut self, value: InputValue) -> Self {
        self.inputs.push(value);
        self
    }

    pub fn add_output_buffer(mut self, shape: Vec<usize>) -> Self {
        self.output_shapes.push(shape);
        self
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }
}

/// Handle to one named ONNX graph.
pub struct OnnxModelSession {
    name: String,
    config: SubModelConfig,
    session: Option<Arc<Mutex<Session>>>,
    metadata: Option<ModelMetadata>,
}

impl std::fmt::Debug for OnnxModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxModelSession")
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl OnnxModelSession {
    pub fn new(name: impl Into<String>, config: SubModelConfig) -> Self {
        Self { name: name.into(), config, session: None, metadata: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    /// Loads the graph from disk. Loading an already-loaded handle is a no-op.
    pub fn load(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        tracing::info!(model = %self.name, path = %self.config.path.display(), "loading sub-model");
        let builder = Session::builder()
            .map_err(|e| DiffusionError::model_load(&self.name, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| DiffusionError::model_load(&self.name, e))?;
        let builder = match self.config.provider {
            ExecutionProviderHint::Cpu => builder,
            ExecutionProviderHint::Cuda => builder
                .with_execution_providers([
                    ort::execution_providers::CUDAExecutionProvider::default().build(),
                    ort::execution_providers::CPUExecutionProvider::default().build(),
                ])
                .map_err(|e| DiffusionError::model_load(&self.name, e))?,
            ExecutionProviderHint::DirectMl => builder
                .with_execution_providers([
                    ort::execution_providers::DirectMLExecutionProvider::default().build(),
                    ort::execution_providers::CPUExecutionProvider::default().build(),
                ])
                .map_err(|e| DiffusionError::model_load(&self.name, e))?,
        };
        let session = builder
            .commit_from_file(&self.config.path)
            .map_err(|e| DiffusionError::model_load(&self.name, e))?;

        self.metadata = Some(Self::read_metadata(&session));
        self.session = Some(Arc::new(Mutex::new(session)));
        Ok(())
    }

    pub fn unload(&mut self) {
        if self.session.take().is_some() {
            tracing::debug!(model = %self.name, "sub-model unloaded");
        }
    }

    /// Graph signature, served from the cache after the first load.
    pub fn metadata(&self) -> Result<&ModelMetadata> {
        self.metadata.as_ref().ok_or_else(|| {
            DiffusionError::model_load(&self.name, "metadata unavailable before first load")
        })
    }

    fn read_metadata(session: &Session) -> ModelMetadata {
        let describe = |name: &str, ty: &ort::value::ValueType| {
            let (shape, dtype) = match ty {
                ort::value::ValueType::Tensor { ty, shape, .. } => {
                    (shape.to_vec(), format!("{ty:?}"))
                }
                other => (Vec::new(), format!("{other:?}")),
            };
            TensorSignature { name: name.to_string(), shape, dtype }
        };
        ModelMetadata {
            inputs: session.inputs.iter().map(|i| describe(&i.name, &i.input_type)).collect(),
            outputs: session.outputs.iter().map(|o| describe(&o.name, &o.output_type)).collect(),
        }
    }

    /// Runs one inference call. Inputs must match the graph's declared input
    /// count and order; every declared output is extracted exactly once.
    pub fn run(&self, params: OnnxInferenceParameters) -> Result<Vec<OutputValue>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| DiffusionError::inference(&self.name, "sub-model is not loaded"))?
            .clone();
        let metadata = self.metadata()?.clone();
        let name = self.name.clone();
        run_session(&name, &session, &metadata, params)
    }

    /// Async façade over [`run`]; the blocking backend call moves to the
    /// blocking thread pool.
    ///
    /// [`run`]: OnnxModelSession::run
    pub async fn run_async(&self, params: OnnxInferenceParameters) -> Result<Vec<OutputValue>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| DiffusionError::inference(&self.name, "sub-model is not loaded"))?
            .clone();
        let metadata = self.metadata()?.clone();
        let name = self.name.clone();
        match tokio::task::spawn_blocking(move || run_session(&name, &session, &metadata, params))
            .await
        {
            Ok(result) => result,
            Err(e) => Err(DiffusionError::inference(&self.name, e)),
        }
    }
}

fn run_session(
    name: &str,
    session: &Arc<Mutex<Session>>,
    metadata: &ModelMetadata,
    params: OnnxInferenceParameters,
) -> Result<Vec<OutputValue>> {
    if params.inputs.len() != metadata.inputs.len() {
        return Err(DiffusionError::shape(
            format!("{} graph inputs", metadata.inputs.len()),
            format!("{} provided", params.inputs.len()),
        ));
    }
    if !params.output_shapes.is_empty() && params.output_shapes.len() != metadata.outputs.len() {
        return Err(DiffusionError::shape(
            format!("{} graph outputs", metadata.outputs.len()),
            format!("{} declared buffers", params.output_shapes.len()),
        ));
    }
    let declared_shapes = params.output_shapes;

    let mut values: Vec<SessionInputValue> = Vec::with_capacity(params.inputs.len());
    for input in params.inputs {
        let value: SessionInputValue = match input {
            InputValue::Float(t) => to_input(name, t)?,
            InputValue::Double(t) => to_input(name, t)?,
            InputValue::Int32(t) => to_input(name, t)?,
            InputValue::Int64(t) => to_input(name, t)?,
            InputValue::Text(texts) => {
                let tensor = Tensor::from_string_array(([texts.len()], texts.as_slice()))
                    .map_err(|e| DiffusionError::inference(name, e))?;
                SessionInputValue::Owned(tensor.into_dyn())
            }
        };
        values.push(value);
    }

    let mut guard = session
        .lock()
        .map_err(|_| DiffusionError::inference(name, "session mutex poisoned"))?;
    let outputs = guard
        .run(values.as_slice())
        .map_err(|e| DiffusionError::inference(name, e))?;

    let mut extracted = Vec::with_capacity(metadata.outputs.len());
    for index in 0..metadata.outputs.len() {
        let value = &outputs[index];
        let output = if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let array = ArrayD::from_shape_vec(dims, data.to_vec())
                .map_err(|e| DiffusionError::inference(name, e))?;
            OutputValue::Float(array)
        } else if let Ok((shape, data)) = value.try_extract_tensor::<i64>() {
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let array = ArrayD::from_shape_vec(dims, data.to_vec())
                .map_err(|e| DiffusionError::inference(name, e))?;
            OutputValue::Int64(array)
        } else if let Ok((shape, data)) = value.try_extract_tensor::<i32>() {
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let widened: Vec<i64> = data.iter().map(|&v| v as i64).collect();
            let array = ArrayD::from_shape_vec(dims, widened)
                .map_err(|e| DiffusionError::inference(name, e))?;
            OutputValue::Int64(array)
        } else {
            return Err(DiffusionError::inference(
                name,
                format!("output {index} has an unsupported element type"),
            ));
        };

        if let Some(declared) = declared_shapes.get(index) {
            let actual = match &output {
                OutputValue::Float(t) => t.shape().to_vec(),
                OutputValue::Int64(t) => t.shape().to_vec(),
            };
            if !declared.is_empty() && declared != &actual {
                return Err(DiffusionError::shape(format!("{declared:?}"), format!("{actual:?}")));
            }
        }
        extracted.push(output);
    }
    Ok(extracted)
}

fn to_input<T>(name: &str, tensor: ArrayD<T>) -> Result<SessionInputValue<'static>>
where
    T: ort::tensor::PrimitiveTensorElementType + std::fmt::Debug + Clone + 'static,
{
    let shape: Vec<usize> = tensor.shape().to_vec();
    let (data, offset) = tensor.into_raw_vec_and_offset();
    debug_assert_eq!(offset, Some(0));
    let value = Tensor::from_array((shape, data)).map_err(|e| DiffusionError::inference(name, e))?;
    Ok(SessionInputValue::Owned(value.into_dyn()))
}
