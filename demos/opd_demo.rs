//! 门诊排队演示程序
//!
//! 依次演示：紧急插队、乱序叫号被拒、医生空闲告警

use chrono::{Duration, Utc};
use medq::core::{Actor, MedqError, Notification, QueueKey, Role, TestType, WorkStatus};
use medq::database::{MemoryAuditLog, MemoryStore};
use medq::workflow::{
    CompletionDetails, DoctorProfile, EngineSettings, EventBroadcaster, InactivitySettings,
    MedicineOrder, QueueEngine, Referral, VisitRequest,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt::init();

    let broadcaster = Arc::new(EventBroadcaster::new());
    let mut events = broadcaster.subscribe();
    let engine = QueueEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryAuditLog::new()),
        broadcaster.clone(),
        EngineSettings::default(),
    );

    let admin = Actor::new(Uuid::new_v4(), Role::Admin);
    let doctor = Actor::new(Uuid::new_v4(), Role::Doctor);
    let reception = Actor::new(Uuid::new_v4(), Role::Receptionist);

    println!("🏥 MedQ 门诊排队演示\n");

    let dr = engine
        .enroll_doctor(
            &admin,
            DoctorProfile {
                name: "Sharma".to_string(),
                department: "General Medicine".to_string(),
                opd_room: "101".to_string(),
            },
        )
        .await?;
    engine
        .set_doctor_work_status(&doctor, dr.id, WorkStatus::InOpd)
        .await?;
    println!("✅ 医生 Dr. {} 已在 {} 诊室开诊", dr.name, dr.opd_room);
    print_events(&mut events);

    // 场景A：紧急插队
    println!("\n📋 场景A：紧急插队");
    let p1 = engine
        .register_visit(&reception, request(dr.id))
        .await?;
    let p2 = engine
        .register_visit(&reception, request(dr.id))
        .await?;
    println!("   P1 号源 {}，P2 号源 {}", p1.token(), p2.token());
    print_next(&engine, dr.id).await?;

    engine
        .mark_emergency(&reception, p2.visit.id, "chest pain")
        .await?;
    println!("   P2 标记为紧急");
    print_next(&engine, dr.id).await?;
    print_events(&mut events);

    // 场景B：乱序叫号
    println!("\n📋 场景B：乱序叫号");
    let p3 = engine
        .register_visit(&reception, request(dr.id))
        .await?;
    match engine.start_service(&doctor, p3.entry.id).await {
        Err(MedqError::OutOfOrder { requested, next }) => {
            println!("   ❌ 拒绝为 {} 开始就诊，应先叫 {}", requested, next);
        }
        other => println!("   意外结果: {:?}", other.map(|e| e.id())),
    }

    engine.start_service(&doctor, p2.entry.id).await?;
    let completed = engine
        .complete_service(
            &doctor,
            p2.entry.id,
            CompletionDetails {
                diagnosis: Some("Unstable angina".to_string()),
                medicines: vec![MedicineOrder {
                    name: "Aspirin".to_string(),
                    dosage: Some("75mg".to_string()),
                }],
                referrals: vec![Referral {
                    test_type: TestType::Lab,
                    urgent: false,
                }],
                result: None,
            },
        )
        .await?;
    println!(
        "   ✅ P2 就诊完成，转诊 {} 项检查（紧急: {}）",
        completed.referrals.len(),
        completed.referrals.iter().all(|r| r.is_emergency)
    );
    print_next(&engine, dr.id).await?;
    print_events(&mut events);

    // 场景C：医生空闲告警
    println!("\n📋 场景C：医生空闲告警");
    let monitor = engine.inactivity_monitor(InactivitySettings::default());
    let findings = monitor.sweep(Utc::now() + Duration::minutes(11)).await?;
    for finding in &findings {
        println!(
            "   ⚠️ 医生 {} 空闲 {} 分钟，{} 位患者候诊",
            finding.doctor_id, finding.idle_minutes, finding.waiting
        );
    }
    print_events(&mut events);

    // 公共大屏
    let board = engine.public_board().await?;
    println!("\n📊 公共大屏:");
    for row in &board.doctors {
        println!(
            "   Dr. {} ({}) 当前号: {:?} 排队: {}",
            row.name,
            row.work_status.as_str(),
            row.current_token,
            row.queue_length
        );
    }
    for row in &board.diagnostics {
        println!("   {} 排队: {}", row.test_type.as_str(), row.active);
    }

    let view = engine.lookup_visit(p1.external_reference(), None).await?;
    println!(
        "\n🔎 P1 查询: 第 {:?} 位，前方 {} 人，预计等待 {} 分钟",
        view.standing.position, view.standing.tokens_ahead, view.standing.estimated_wait_minutes
    );

    println!("\n🎉 演示完成");
    Ok(())
}

fn request(doctor_id: Uuid) -> VisitRequest {
    VisitRequest {
        patient_id: Uuid::new_v4(),
        doctor_id,
        is_emergency: false,
        is_protected: false,
    }
}

async fn print_next(engine: &QueueEngine, doctor_id: Uuid) -> anyhow::Result<()> {
    let next = engine.get_next(QueueKey::Opd { doctor_id }).await?;
    match next {
        Some(entry) => println!("   下一位: 条目 {} ({})", entry.id(), entry.status().as_str()),
        None => println!("   队列为空"),
    }
    Ok(())
}

fn print_events(events: &mut broadcast::Receiver<Notification>) {
    while let Ok(notification) = events.try_recv() {
        println!(
            "   📣 {}",
            serde_json::to_string(&notification.event).unwrap_or_default()
        );
    }
}
