//! Stage orchestration: prepare, train, merge, smoke test, convert, Modelfile

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tch::{Device, Kind};

use crate::config::TuneConfig;
use crate::data::{self, ChatTokenizer, DatasetStats, FormattedExample};
use crate::export::{self, GgufOptions, MergeOptions, MergeSummary, ModelfileParams, ToolRunner};
use crate::inference::{self, Generation, SamplingConfig};
use crate::lora::{AdapterConfig, LoraAdapter};
use crate::model::{self, LlamaConfig, LlamaModel, LoadOptions, QuantSpec};
use crate::training::{SftTrainer, TrainOutcome};
use crate::constants::MODEL_CONFIG_FILE;

/// Results of a full run
#[derive(Debug)]
pub struct RunSummary {
    pub training: TrainOutcome,
    pub merge: MergeSummary,
    pub generation: Generation,
    pub gguf: PathBuf,
    pub modelfile: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: TuneConfig,
    show_progress: bool,
}

impl Pipeline {
    pub fn new(config: TuneConfig) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        Ok(Self {
            config,
            show_progress: true,
        })
    }

    /// Show or hide the training progress bar
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &TuneConfig {
        &self.config
    }

    fn device(&self) -> Result<Device> {
        model::resolve_device(&self.config.model.device)
    }

    /// Activations run in the configured compute dtype on CUDA and in f32 on CPU
    fn compute_kind(&self, device: Device) -> Kind {
        let kind = self.config.quantization.compute_dtype.kind();
        if device == Device::Cpu && kind != Kind::Float {
            tracing::info!("CPU run: computing in float32 instead of {:?}", kind);
            return Kind::Float;
        }
        kind
    }

    /// Load and flatten the training file, optionally writing the formatted
    /// records as JSONL
    pub fn prepare(&self, formatted_out: Option<&Path>) -> Result<Vec<FormattedExample>> {
        let path = &self.config.data.training_file;
        let examples = data::load_training_data(path)
            .with_context(|| format!("Failed to load training data from {}", path.display()))?;
        DatasetStats::from_examples(&examples).log();

        if let Some(out) = formatted_out {
            data::write_formatted(out, &examples)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            tracing::info!("Wrote {} formatted examples to {}", examples.len(), out.display());
        }
        Ok(examples)
    }

    /// Local directory of the base model, downloading it if needed
    pub async fn resolve_base(&self) -> Result<PathBuf> {
        model::resolve_model_dir(&self.config.model.name, self.config.model.revision.as_deref())
            .await
            .with_context(|| format!("Failed to resolve base model '{}'", self.config.model.name))
    }

    fn load_tokenizer(dir: &Path) -> Result<ChatTokenizer> {
        let model_config = LlamaConfig::from_file(&dir.join(MODEL_CONFIG_FILE))?;
        let fallback_eos = model_config.eos_token_id.as_ref().and_then(|ids| ids.first());
        ChatTokenizer::from_dir(dir, fallback_eos)
            .with_context(|| format!("Failed to load tokenizer from {}", dir.display()))
    }

    /// Fine-tune adapters over the 4-bit base and save them to the output directory
    pub async fn train(&self) -> Result<TrainOutcome> {
        let examples = self.prepare(None)?;
        let base_dir = self.resolve_base().await?;
        let tokenizer = Self::load_tokenizer(&base_dir)?;
        let encoded = data::encode_examples(&tokenizer, &examples, self.config.data.max_seq_length)
            .context("Failed to tokenize training data")?;
        if encoded.is_empty() {
            return Err(anyhow!("No trainable examples after tokenization"));
        }

        let device = self.device()?;
        let q = &self.config.quantization;
        let opts = LoadOptions {
            device,
            kind: self.compute_kind(device),
            quantization: q.load_in_4bit.then_some(QuantSpec {
                quant_type: q.quant_type,
                block_size: q.block_size,
                double_quant: q.double_quant,
            }),
        };
        let model = LlamaModel::load(&base_dir, opts)
            .with_context(|| format!("Failed to load base model from {}", base_dir.display()))?;

        tch::manual_seed(self.config.training.seed as i64);
        let adapter_config = AdapterConfig::from_lora(&self.config.lora, &self.config.model.name);
        let adapter = LoraAdapter::new(model.config(), adapter_config, device)?;
        let trainable = adapter.trainable_parameters();
        let total = model.parameter_count() + trainable;
        tracing::info!(
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            trainable,
            total,
            100.0 * trainable as f64 / total.max(1) as f64
        );

        let mut trainer = SftTrainer::new(
            &model,
            &adapter,
            &self.config.training,
            i64::from(tokenizer.pad_id()),
        )?
        .with_progress(self.show_progress);
        let outcome = trainer.train(&encoded)?;

        export::save_adapter(&adapter, &tokenizer, &self.config.training.output_dir)?;
        Ok(outcome)
    }

    /// Merge the saved adapter into a half-precision copy of the base
    pub async fn merge(&self) -> Result<MergeSummary> {
        let base_dir = self.resolve_base().await?;
        let adapter_dir = &self.config.training.output_dir;
        let tokenizer = ChatTokenizer::from_dir(adapter_dir, None)
            .or_else(|_| Self::load_tokenizer(&base_dir))?;
        let opts = MergeOptions {
            device: self.device()?,
            dtype: self.config.export.merge_dtype,
            max_shard_size: self.config.export.max_shard_size,
        };
        export::merge_and_save(&base_dir, adapter_dir, &self.config.export.merged_dir, &tokenizer, &opts)
    }

    /// Generate one completion with the merged model
    pub fn smoke_test(&self) -> Result<Generation> {
        let merged_dir = &self.config.export.merged_dir;
        let device = self.device()?;
        let kind = if device == Device::Cpu {
            Kind::Float
        } else {
            self.config.export.merge_dtype.kind()
        };
        let model = LlamaModel::load(
            merged_dir,
            LoadOptions {
                device,
                kind,
                quantization: None,
            },
        )
        .with_context(|| format!("Failed to load merged model from {}", merged_dir.display()))?;
        let tokenizer = Self::load_tokenizer(merged_dir)?;

        let prompt = inference::smoke_test_prompt(self.config.generation.prompt_file.as_deref())?;
        let sampling = SamplingConfig::from(&self.config.generation);
        inference::generate(&model, None, &tokenizer, &prompt, &sampling)
    }

    /// Convert the merged model to GGUF
    pub async fn convert(&self, runner: &dyn ToolRunner) -> Result<PathBuf> {
        let export = &self.config.export;
        let opts = GgufOptions {
            python: export.python.clone(),
            llama_cpp_dir: export.llama_cpp_dir.clone(),
            merged_dir: export.merged_dir.clone(),
            outfile: export.gguf_file.clone(),
            outtype: export.gguf_outtype.clone(),
        };
        Ok(export::convert_to_gguf(runner, &opts).await?)
    }

    /// Write the Ollama Modelfile next to the GGUF file
    pub fn modelfile(&self) -> Result<PathBuf> {
        let dir = self
            .config
            .export
            .gguf_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let params = ModelfileParams::from_config(&self.config);
        Ok(export::write_modelfile(&dir, &params)?)
    }

    /// Every stage in order
    pub async fn run(&self, runner: &dyn ToolRunner) -> Result<RunSummary> {
        let training = self.train().await.context("Training failed")?;
        let merge = self.merge().await.context("Merge failed")?;
        let generation = self.smoke_test().context("Smoke test failed")?;
        let gguf = self.convert(runner).await.context("GGUF conversion failed")?;
        let modelfile = self.modelfile()?;
        Ok(RunSummary {
            training,
            merge,
            generation,
            gguf,
            modelfile,
        })
    }
}

/// Text printed after the smoke test
pub fn render_sample(generation: &Generation, max_chars: usize) -> String {
    format!(
        "Test generation sample:\n{}",
        inference::preview(&generation.text, max_chars)
    )
}

/// Text printed after the Modelfile is written
pub fn ollama_hint(model_name: &str, modelfile: &Path) -> String {
    format!("Run: ollama create {} -f {}", model_name, modelfile.display())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::export::DryRunRunner;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = TuneConfig::default();
        config.training.gradient_accumulation_steps = 0;
        assert!(Pipeline::new(config).is_err());
    }

    #[test]
    fn test_prepare_writes_formatted_records() {
        let dir = tempdir().expect("test: tempdir");
        let input = dir.path().join("training.jsonl");
        let mut file = std::fs::File::create(&input).expect("test: create");
        writeln!(
            file,
            r#"{{"messages":[{{"role":"user","content":"U"}},{{"role":"assistant","content":"A"}}]}}"#
        )
        .expect("test: write");

        let mut config = TuneConfig::default();
        config.data.training_file = input;
        let pipeline = Pipeline::new(config).expect("test: pipeline");
        let out = dir.path().join("formatted.jsonl");
        let examples = pipeline.prepare(Some(&out)).expect("test: prepare");
        assert_eq!(examples[0].text, "<|user|>\nU\n<|assistant|>\nA\n<|end|>");
        let written = std::fs::read_to_string(out).expect("test: read");
        assert_eq!(written.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_convert_and_modelfile_dry_run() {
        let dir = tempdir().expect("test: tempdir");
        let llama_cpp = dir.path().join("llama.cpp");
        std::fs::create_dir_all(&llama_cpp).expect("test: mkdir");
        std::fs::write(llama_cpp.join("convert_hf_to_gguf.py"), "").expect("test: script");

        let mut config = TuneConfig::default();
        config.export.llama_cpp_dir = llama_cpp;
        config.export.gguf_file = dir.path().join("react-testgen.gguf");
        config.export.gguf_outtype = "q8_0".to_string();
        let pipeline = Pipeline::new(config).expect("test: pipeline");

        let runner = DryRunRunner::new();
        let gguf = pipeline.convert(&runner).await.expect("test: convert");
        assert_eq!(gguf, dir.path().join("react-testgen.gguf"));
        assert_eq!(runner.commands().len(), 1);

        let modelfile = pipeline.modelfile().expect("test: modelfile");
        assert_eq!(modelfile, dir.path().join("Modelfile"));
        assert!(ollama_hint("react-testgen", &modelfile).starts_with("Run: ollama create react-testgen -f "));
    }
}
