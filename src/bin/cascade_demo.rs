// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 多路合成流级联推理演示
/// Synthetic multi-stream cascade demo
///
/// 直接运行: cargo run --bin cascade-demo --release -- --streams 4 --faces
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};
use mimalloc::MiMalloc;

use rtsp_cascade::capability::{FaceAnalysis, SystemClock};
use rtsp_cascade::logger;
use rtsp_cascade::models::ModelSpec;
use rtsp_cascade::sim::{
    LogRenderer, Scene, SyntheticDecoderFactory, SyntheticEngine, SyntheticFaceAnalysis,
};
use rtsp_cascade::{Pipeline, PipelineConfig, StatsScope};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 级联推理演示程序
#[derive(Parser, Debug)]
#[command(author, version, about = "多路合成流级联推理演示", long_about = None)]
struct Args {
    /// 配置文件 (JSON); 不存在时写入默认配置
    #[arg(short, long)]
    config: Option<String>,

    /// 合成流数量
    #[arg(short, long, default_value_t = 2)]
    streams: usize,

    /// 配置中没有模型时使用的模型 (yolov5 / yolov8)
    #[arg(short, long, default_value = "yolov5")]
    model: String,

    /// 运行时长 (秒)
    #[arg(short, long, default_value_t = 15)]
    duration: u64,

    /// 合成解码帧率
    #[arg(long, default_value_t = 25)]
    fps: u32,

    /// 合成推理耗时 (毫秒)
    #[arg(long, default_value_t = 30)]
    latency_ms: u64,

    /// 启用二阶段人脸属性分析
    #[arg(long)]
    faces: bool,

    /// 统计报告间隔 (秒)
    #[arg(long, default_value_t = 5)]
    report_secs: u64,

    /// 日志级别 (RUST_LOG 优先)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init(logger::parse_level(&args.log_level));

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load_or_default(path),
        None => PipelineConfig::default(),
    };
    if args.faces {
        config.cascade.enable_face_analysis = true;
    }
    if config.models.is_empty() {
        config.models.push(match args.model.as_str() {
            "yolov8" => ModelSpec::yolov8("yolov8n"),
            _ => ModelSpec::yolov5("yolov5s"),
        });
    }
    config.print_summary();

    let face: Option<Arc<dyn FaceAnalysis>> = if config.cascade.enable_face_analysis {
        Some(Arc::new(SyntheticFaceAnalysis::new(42, None)))
    } else {
        None
    };
    let decoders = Arc::new(SyntheticDecoderFactory {
        width: 1280,
        height: 720,
        fps: args.fps,
    });
    let pipeline = Pipeline::new(config.clone(), decoders, face, SystemClock::shared())?;

    let latency = Duration::from_millis(args.latency_ms);
    for spec in &config.models {
        let factory = SyntheticEngine::factory(spec.clone(), Scene::Random { max_objects: 6 }, latency, None);
        pipeline.register_model(spec.clone(), b"synthetic-model", factory)?;
    }

    let renderer = Arc::new(LogRenderer::new());
    let mut handles = Vec::with_capacity(args.streams);
    for i in 0..args.streams {
        let id = format!("cam-{}", i + 1);
        // 第一路优先级更高
        let priority = if i == 0 { 2 } else { 1 };
        let handle = pipeline.add_stream(id.as_str(), &format!("sim://{}", id), priority)?;
        pipeline.bind_render_surface(handle, renderer.clone())?;
        pipeline.start(handle)?;
        handles.push(handle);
    }
    println!(
        "✅ {} 路合成流 | 模型 {} | 推理 {}ms | 运行 {}s",
        args.streams,
        config.models[0].tag,
        args.latency_ms,
        args.duration
    );

    let started = Instant::now();
    let deadline = Duration::from_secs(args.duration);
    let interval = Duration::from_secs(args.report_secs.max(1));
    while started.elapsed() < deadline {
        std::thread::sleep(interval.min(deadline.saturating_sub(started.elapsed())));
        for handle in &handles {
            match pipeline.stream_health(*handle) {
                Ok(health) => info!(
                    "💓 {} delivered {} | since last {}ms | restarts {}",
                    health.stream, health.delivered, health.since_success_ms, health.total_restarts
                ),
                Err(e) => warn!("⚠️  {}: {}", handle, e),
            }
            println!("{}", pipeline.stats_report(*handle)?);
        }
        for spec in &config.models {
            let m = pipeline.dispatcher_metrics(&spec.model_tag())?;
            info!(
                "📊 {}: submitted {} completed {} failed {} backpressured {} evicted {} depth {}/{}",
                spec.tag, m.submitted, m.completed, m.failed, m.backpressured, m.evicted, m.depth, m.peak_depth
            );
        }
    }

    let global = pipeline.stats_snapshot(StatsScope::Global)?;
    println!("{}", serde_json::to_string_pretty(&global)?);
    println!("🖼️  presented {} frames", renderer.presented());
    pipeline.shutdown();
    Ok(())
}
