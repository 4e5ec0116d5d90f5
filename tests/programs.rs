//! End-to-end scenarios driven through the public driver only

use gwbasic::{BufferConsole, Interpreter, Value};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

fn run(source: &str) -> (Interpreter, String) {
    let console = Rc::new(RefCell::new(BufferConsole::new()));
    let mut interp = Interpreter::with_console(Box::new(console.clone()));
    interp.execute(source).expect("program should run");
    let output = console.borrow().output();
    (interp, output)
}

fn temp_path(name: &str) -> String {
    let mut p = PathBuf::from(std::env::temp_dir());
    p.push(format!("gwbasic-e2e-{}-{}", std::process::id(), name));
    p.to_string_lossy().into_owned()
}

#[test]
fn hello_world() {
    let (_, output) = run("10 PRINT \"HELLO\"");
    assert_eq!(output, "HELLO");
}

#[test]
fn nested_loops_with_gosub() {
    let src = "\
10 T = 0
20 FOR I = 1 TO 3
30 FOR J = 1 TO 3
40 GOSUB 100
50 NEXT J
60 NEXT I
70 PRINT T
80 END
100 T = T + I * J
110 RETURN";
    let (_, output) = run(src);
    assert_eq!(output, " 36 ");
}

#[test]
fn structured_program_mixes_with_line_numbers() {
    let src = "\
10 LIMIT = 4
20 X = SUMTO(LIMIT)
30 PRINT X
40 END
50 FUNCTION SUMTO (N)
60 S = 0
70 FOR I = 1 TO N
80 S = S + I
90 NEXT I
100 SUMTO = S
110 END FUNCTION";
    let (_, output) = run(src);
    assert_eq!(output, " 10 ");
}

#[test]
fn sequential_file_round_trip() {
    let path = temp_path("seq.txt");
    let src = format!(
        "\
10 OPEN \"{p}\" FOR OUTPUT AS #1
20 PRINT #1, \"FIRST LINE\"
30 WRITE #1, \"A B\", 42
40 CLOSE #1
50 OPEN \"{p}\" FOR INPUT AS #1
60 LINE INPUT #1, L$
70 INPUT #1, S$, N
80 E = EOF(1)
90 CLOSE
100 PRINT L$; \"|\"; S$; \"|\"; N; E
110 KILL \"{p}\"",
        p = path
    );
    let (interp, output) = run(&src);
    assert_eq!(output, "FIRST LINE|A B| 42 -1 ");
    assert_eq!(interp.var("N"), Some(Value::Number(42.0)));
    assert!(!std::path::Path::new(&path).exists());
}

#[test]
fn random_access_records() {
    let path = temp_path("rand.dat");
    let src = format!(
        "\
10 OPEN \"{p}\" FOR RANDOM AS #1 LEN = 16
20 FIELD #1, 10 AS N$, 6 AS A$
30 LSET N$ = \"BOB\"
40 RSET A$ = \"42\"
50 PUT #1, 2
60 LSET N$ = \"SUE\"
70 RSET A$ = \"7\"
80 PUT #1, 1
90 GET #1, 2
100 PRINT N$; \"/\"; A$
110 CLOSE
120 KILL \"{p}\"",
        p = path
    );
    let (_, output) = run(&src);
    assert_eq!(output, "BOB       /    42");
}

#[test]
fn on_error_recovers_from_missing_file() {
    let src = "\
10 ON ERROR GOTO 100
20 OPEN \"no-such-gwbasic-file.xyz\" FOR INPUT AS #1
30 PRINT \"OPENED\"
40 END
100 PRINT \"CODE\"; ERR
110 RESUME NEXT";
    let (_, output) = run(src);
    assert_eq!(output, "CODE 53 \nOPENED");
}

#[test]
fn double_buffered_drawing_flips_pages() {
    let src = "\
10 SCREEN 7, 1, 0
20 LINE (0,0)-(10,0),12
30 SCREEN 7, 0, 1";
    let (interp, _) = run(src);
    interp.with_graphics(|g| {
        // The line went to page 1, now the visual page
        assert_eq!(g.visual().get_pixel(5, 0), 12);
        assert_eq!(g.active_ref().get_pixel(5, 0), 0);
    });
}

#[test]
fn circle_and_flood_fill() {
    let src = "\
10 SCREEN 12
20 CIRCLE (100,100),20,15
30 PAINT (100,100),4,15";
    let (interp, _) = run(src);
    interp.with_graphics(|g| {
        let fb = g.active_ref();
        assert_eq!(fb.get_pixel(100, 100), 4);
        assert_eq!(fb.get_pixel(120, 100), 15);
        assert_eq!(fb.get_pixel(130, 100), 0);
    });
}

#[test]
fn draw_macro_square() {
    let src = "\
10 SCREEN 12
20 PSET (100,100),0
30 DRAW \"C2 R10 D10 L10 U10\"";
    let (interp, _) = run(src);
    interp.with_graphics(|g| {
        let fb = g.active_ref();
        assert_eq!(fb.get_pixel(105, 100), 2);
        assert_eq!(fb.get_pixel(110, 105), 2);
        assert_eq!(fb.get_pixel(105, 110), 2);
        assert_eq!(fb.get_pixel(100, 105), 2);
    });
}

#[test]
fn deterministic_framebuffer_with_seeded_rnd() {
    let src = "\
10 RANDOMIZE 42
20 SCREEN 13
30 FOR I = 1 TO 50
40 PSET (INT(RND * 320), INT(RND * 200)), INT(RND * 255)
50 NEXT I";
    let (a, _) = run(src);
    let (b, _) = run(src);
    let pixels_a = a.with_graphics(|g| g.active_ref().bgra().to_vec());
    let pixels_b = b.with_graphics(|g| g.active_ref().bgra().to_vec());
    assert_eq!(pixels_a, pixels_b);
}

#[test]
fn qbasic_style_program_with_do_loop_and_select() {
    let src = "\
total = 0
n = 1
DO WHILE n <= 5
  SELECT CASE n
    CASE 1, 2
      total = total + 10
    CASE IS >= 4
      total = total + 1
    CASE ELSE
      total = total + 100
  END SELECT
  n = n + 1
LOOP
PRINT total";
    let (_, output) = run(src);
    assert_eq!(output, " 122 ");
}

#[test]
fn chunked_host_sees_progress() {
    let mut interp = Interpreter::new();
    interp
        .load("10 C = 0\n20 FOR I = 1 TO 200\n30 C = C + 1\n40 NEXT I")
        .expect("load");
    interp.initialize_execution();
    let mut more = true;
    while more {
        more = interp.execute_chunk(37).expect("chunk");
    }
    assert_eq!(interp.var("C"), Some(Value::Number(200.0)));
}
