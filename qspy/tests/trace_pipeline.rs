//! 目标字节流 -> 会话 的端到端测试
//!
//! 覆盖：
//! 1. 帧编码/解码与转义（ID 5，负载含 FLAG）
//! 2. 单条记录解析失败不影响后续记录，也不改动字典和时序图
//! 3. 序列号跳变只记录、不失步
//! 4. 字典保存再加载
//! 5. 字典文件与目标配置不一致时全部清空
//! 6. 回放文件跑完整个事件循环

use std::fs;
use std::path::PathBuf;

use qs_proto::record::{put_str, put_uint};
use qs_proto::{
    FrameDecoder, FrameEncoder, RecKind, SessionConfig, TargetInfo, WidthTable, ESC, FLAG,
};
use qspy::dict::DictError;
use qspy::{Dictionaries, Directive, Session, SessionOptions, SinkKind, Switch, TargetLink};

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("qspy_it_{}_{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// 以指定序列号编码一帧
fn frame_at(seq: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    FrameEncoder::resume(seq.wrapping_sub(1))
        .encode_record(id, payload)
        .unwrap()
}

fn obj_dict(key: u64, name: &str) -> Vec<u8> {
    let mut p = Vec::new();
    put_uint(&mut p, key, 4);
    put_str(&mut p, name);
    p
}

fn fun_dict(key: u64, name: &str) -> Vec<u8> {
    obj_dict(key, name)
}

fn sig_dict(sig: u64, obj: u64, name: &str) -> Vec<u8> {
    let mut p = Vec::new();
    put_uint(&mut p, sig, 2);
    put_uint(&mut p, obj, 4);
    put_str(&mut p, name);
    p
}

/// AO-Subsc: 时间戳, 信号, 对象
fn subscribe(ts: u64, sig: u64, obj: u64) -> Vec<u8> {
    let mut p = Vec::new();
    put_uint(&mut p, ts, 4);
    put_uint(&mut p, sig, 2);
    put_uint(&mut p, obj, 4);
    p
}

fn target_info(obj_ptr: u8, is_reset: bool) -> TargetInfo {
    let widths = WidthTable {
        obj_ptr,
        ..WidthTable::default()
    };
    TargetInfo {
        is_reset,
        config: SessionConfig {
            version: 720,
            widths,
        },
        max_active: 16,
        max_epool: 3,
        max_tick_rate: 2,
        build: [5, 4, 3, 16, 10, 26],
    }
}

#[test]
fn test_end_to_end_id5_with_escaped_flag() {
    let wire = frame_at(0x10, 5, &[0x01, 0x7E, 0x02]);
    // 负载里的 0x7E 必须被转义
    assert!(wire.windows(2).any(|w| w == [ESC, FLAG ^ 0x20]));
    assert_eq!(wire.iter().filter(|&&b| b == FLAG).count(), 1);
    assert_eq!(*wire.last().unwrap(), FLAG);

    let mut decoder = FrameDecoder::new();
    let mut got = Vec::new();
    decoder.feed(&wire, |res| {
        let frame = res.unwrap();
        got.push((frame.seq, frame.rec_id, frame.payload.to_vec()));
    });
    assert_eq!(got, vec![(0x10, 5, vec![0x01, 0x7E, 0x02])]);
}

#[test]
fn test_parse_failure_is_atomic() {
    let mut session = Session::new(SessionOptions::default()).unwrap();

    // ID 5 (=>Intern) 需要 12 字节，3 字节负载解析失败
    let mut data = frame_at(1, 5, &[0x01, 0x7E, 0x02]);
    data.extend(frame_at(2, RecKind::ObjDict.id(), &obj_dict(0x2000, "AO_Table")));
    data.extend(frame_at(3, RecKind::ActiveSubscribe.id(), &subscribe(42, 7, 0x2000)));
    session.on_link_data(&data);

    let stats = session.stats();
    assert_eq!(stats.frames, 3);
    assert_eq!(stats.parse_errors, 1);
    assert_eq!(stats.gaps, 0);
    assert_eq!(session.dictionaries().obj(0x2000), Some("AO_Table"));

    let out = session.take_outbox();
    assert_eq!(out.screen.len(), 2);
    assert_eq!(out.screen[1], "0000000042 AO-Subsc  Sig=7,Obj=AO_Table");
}

#[test]
fn test_parse_failure_leaves_sequence_untouched() {
    let dir = temp_dir("atomic_seq");
    let mut session = Session::new(SessionOptions {
        out_dir: dir.clone(),
        quiet: true,
        lanes: vec!["AO_Table".to_string(), "AO_Philo[0]".to_string()],
        ..SessionOptions::default()
    })
    .unwrap();
    session.apply(Directive::SequenceFile(Switch::On));
    let path = session.outputs().path(SinkKind::Sequence).unwrap().to_path_buf();

    let mut data = frame_at(1, RecKind::ObjDict.id(), &obj_dict(0x10, "AO_Table"));
    data.extend(frame_at(2, RecKind::ObjDict.id(), &obj_dict(0x20, "AO_Philo[0]")));
    data.extend(frame_at(3, RecKind::SigDict.id(), &sig_dict(6, 0, "HUNGRY_SIG")));

    // AO-Post 截断在信号字段之前
    let mut post = Vec::new();
    put_uint(&mut post, 1200, 4);
    put_uint(&mut post, 0x10, 4);
    put_uint(&mut post, 0x20, 4);
    data.extend(frame_at(4, RecKind::ActivePost.id(), &post));

    // 名字长度前缀比实际内容长，整条对象字典记录作废
    let mut remap = obj_dict(0x30, "AO_Philo[0]");
    remap.pop();
    data.extend(frame_at(5, RecKind::ObjDict.id(), &remap));

    // =>Ignore: 时间戳, 信号, 对象, 状态
    let mut ignored = Vec::new();
    put_uint(&mut ignored, 50, 4);
    put_uint(&mut ignored, 6, 2);
    put_uint(&mut ignored, 0x10, 4);
    put_uint(&mut ignored, 0x8000, 4);
    data.extend(frame_at(6, RecKind::Ignored.id(), &ignored));
    session.on_link_data(&data);

    assert_eq!(session.stats().parse_errors, 2);
    assert_eq!(session.dictionaries().obj(0x30), None);
    assert_eq!(session.sequence().lane_of(0x30), None);
    assert_eq!(session.sequence().lane_of(0x10), Some(0));
    assert_eq!(session.sequence().lane_of(0x20), Some(1));
    session.shutdown();

    // 表头三行，之后只有被忽略事件的标注
    let content = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[3].starts_with("0000000050"));
    assert!(lines[3].contains("X(HUNGRY_SIG)"));

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_sequence_gap_tolerated() {
    let mut session = Session::new(SessionOptions::default()).unwrap();

    let mut data = Vec::new();
    for (seq, ts) in [(1u8, 10u64), (2, 20), (9, 30), (10, 40)] {
        data.extend(frame_at(seq, RecKind::ActiveSubscribe.id(), &subscribe(ts, 1, 0x10)));
    }
    // 分两段送入，跨越帧边界
    let (a, b) = data.split_at(data.len() / 2 + 3);
    session.on_link_data(a);
    session.on_link_data(b);

    let stats = session.stats();
    assert_eq!(stats.frames, 4);
    assert_eq!(stats.gaps, 1);
    assert_eq!(stats.bad_frames, 0);

    let screen = session.take_outbox().screen;
    assert_eq!(screen.len(), 4);
    assert!(screen[3].starts_with("0000000040 "));
}

#[test]
fn test_corrupted_frame_does_not_disturb_next() {
    let mut session = Session::new(SessionOptions::default()).unwrap();

    let mut bad = frame_at(1, RecKind::ObjDict.id(), &obj_dict(0x10, "AO_Bad"));
    bad[4] ^= 0x04;
    let mut data = bad;
    data.extend(frame_at(2, RecKind::ObjDict.id(), &obj_dict(0x20, "AO_Good")));
    session.on_link_data(&data);

    assert_eq!(session.stats().bad_frames, 1);
    assert_eq!(session.dictionaries().obj(0x10), None);
    assert_eq!(session.dictionaries().obj(0x20), Some("AO_Good"));
}

#[test]
fn test_dictionary_save_and_reload() {
    let dir = temp_dir("dict");
    let dict_path = dir.join("target.dic");
    let opts = SessionOptions {
        dict_path: Some(dict_path.clone()),
        out_dir: dir.clone(),
        ..SessionOptions::default()
    };

    let mut first = Session::new(opts.clone()).unwrap();
    let mut data = frame_at(
        1,
        RecKind::TargetInfo.id(),
        &target_info(4, true).to_payload(),
    );
    data.extend(frame_at(2, RecKind::ObjDict.id(), &obj_dict(0x2000, "AO_Table")));
    data.extend(frame_at(3, RecKind::FunDict.id(), &fun_dict(0x8000, "Table_serving")));
    data.extend(frame_at(4, RecKind::SigDict.id(), &sig_dict(5, 0, "EAT_SIG")));
    // 目标可以上报空名字
    data.extend(frame_at(5, RecKind::ObjDict.id(), &obj_dict(0x3000, "")));
    first.on_link_data(&data);
    first.apply(Directive::SaveDictionaries);
    assert!(dict_path.exists());

    let second = Session::new(opts).unwrap();
    assert_eq!(second.dictionaries(), first.dictionaries());
    assert_eq!(second.config(), first.config());
    assert_eq!(second.dictionaries().fun(0x8000), Some("Table_serving"));
    assert_eq!(second.dictionaries().sig(5, 0x2000), Some("EAT_SIG"));
    assert_eq!(second.dictionaries().obj(0x3000), Some(""));

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_dictionary_mismatch_resets_everything() {
    // 直接读取：文件声明对象指针 4 字节，目标报告 8 字节
    let mut dicts = Dictionaries::new();
    dicts.put_obj(0x10, "AO_Table");
    dicts.put_fun(0x20, "Table_idle");
    dicts.put_sig(4, 0, "TIMEOUT_SIG");
    dicts.put_usr(100, "PHILO_STAT");
    let mut file = Vec::new();
    dicts.write_all(&mut file, &SessionConfig::default()).unwrap();

    let live = target_info(8, false).config;
    let mut loaded = dicts.clone();
    let err = loaded.read_all(&file[..], Some(&live)).unwrap_err();
    assert!(matches!(err, DictError::ConfigMismatch { .. }));
    assert!(loaded.is_empty());

    // 会话：启动时加载字典文件，随后目标上报不同配置
    let dir = temp_dir("mismatch");
    let dict_path = dir.join("old.dic");
    fs::write(&dict_path, &file).unwrap();
    let mut session = Session::new(SessionOptions {
        dict_path: Some(dict_path),
        out_dir: dir.clone(),
        ..SessionOptions::default()
    })
    .unwrap();
    assert_eq!(session.dictionaries().obj(0x10), Some("AO_Table"));

    session.on_link_data(&frame_at(
        1,
        RecKind::TargetInfo.id(),
        &target_info(8, false).to_payload(),
    ));
    assert!(session.dictionaries().is_empty());
    assert_eq!(session.config().widths.obj_ptr, 8);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_reconnect_keeps_dictionaries() {
    let mut session = Session::new(SessionOptions::default()).unwrap();
    session.on_link_data(&frame_at(7, RecKind::ObjDict.id(), &obj_dict(0x30, "AO_Philo[0]")));
    // 半帧残留
    session.on_link_data(&[0x08, 0x3D, 0x01]);

    session.on_reconnect();
    session.on_link_data(&frame_at(1, RecKind::ObjDict.id(), &obj_dict(0x40, "AO_Philo[1]")));

    let stats = session.stats();
    assert_eq!(stats.bad_frames, 0);
    assert_eq!(stats.gaps, 0);
    assert_eq!(session.dictionaries().obj(0x30), Some("AO_Philo[0]"));
    assert_eq!(session.dictionaries().obj(0x40), Some("AO_Philo[1]"));
}

#[test]
fn test_sequence_output_file() {
    let dir = temp_dir("seqfile");
    let mut session = Session::new(SessionOptions {
        out_dir: dir.clone(),
        lanes: vec!["AO_Table".to_string(), "AO_Philo[0]".to_string()],
        ..SessionOptions::default()
    })
    .unwrap();
    session.apply(Directive::SequenceFile(Switch::On));
    let path = session.outputs().path(SinkKind::Sequence).unwrap().to_path_buf();

    let mut data = frame_at(1, RecKind::ObjDict.id(), &obj_dict(0x10, "AO_Table"));
    data.extend(frame_at(2, RecKind::ObjDict.id(), &obj_dict(0x20, "AO_Philo[0]")));
    data.extend(frame_at(3, RecKind::SigDict.id(), &sig_dict(6, 0, "HUNGRY_SIG")));
    // AO-Post: 时间戳, 发送方, 接收方, 信号, 池/引用, 空闲, 最小
    let mut post = Vec::new();
    put_uint(&mut post, 1200, 4);
    put_uint(&mut post, 0x10, 4);
    put_uint(&mut post, 0x20, 4);
    put_uint(&mut post, 6, 2);
    post.extend_from_slice(&[0x00, 0x00]);
    post.push(3);
    post.push(2);
    data.extend(frame_at(4, RecKind::ActivePost.id(), &post));
    session.on_link_data(&data);
    session.shutdown();

    let content = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[1].contains("AO_Table"));
    assert!(lines[3].starts_with("0000001200"));
    assert!(lines[3].contains("HUNGRY_SIG"));
    assert!(lines[3].contains("->|"));

    fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_replay_file_runs_to_end() {
    let dir = temp_dir("replay");
    let bin = dir.join("trace.bin");
    let mut data = frame_at(1, RecKind::ObjDict.id(), &obj_dict(0x2000, "AO_Table"));
    data.extend(frame_at(2, RecKind::ActiveSubscribe.id(), &subscribe(99, 3, 0x2000)));
    fs::write(&bin, &data).unwrap();

    let mut session = Session::new(SessionOptions {
        out_dir: dir.clone(),
        quiet: true,
        ..SessionOptions::default()
    })
    .unwrap();
    session.apply(Directive::TextFile(Switch::On));
    let txt = session.outputs().path(SinkKind::Text).unwrap().to_path_buf();

    let link = TargetLink::open_file(&bin).await.unwrap();
    qspy::run(session, link, None, false).await.unwrap();

    let content = fs::read_to_string(&txt).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1], "0000000099 AO-Subsc  Sig=3,Obj=AO_Table");

    fs::remove_dir_all(&dir).ok();
}
